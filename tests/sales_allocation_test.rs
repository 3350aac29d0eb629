mod common;

use assert_matches::assert_matches;
use bakeline_core::{
    entities::{product_batch, sales_order::SalesOrderStatus},
    errors::ServiceError,
};
use chrono::{Duration, Utc};
use common::{days_from_today, dec, receipt, seed_batch, seed_bakery, Bakery, TestApp};
use rust_decimal::Decimal;
use sea_orm::EntityTrait;

async fn available(app: &TestApp, batch_id: i64) -> Decimal {
    product_batch::Entity::find_by_id(batch_id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap()
        .available_quantity
}

async fn draft_sale(app: &TestApp, bakery: &Bakery) -> bakeline_core::entities::sales_order::Model {
    app.core
        .sales
        .create_order(bakery.tenant.id, bakery.warehouse.id, None, Some("clerk".into()))
        .await
        .expect("draft sale")
}

#[tokio::test]
async fn allocation_is_first_expiring_first_out_with_creation_tiebreak() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;

    let t0 = Utc::now();
    // B1 expires last; B2 and B3 share the soonest expiry, B2 created first.
    let b1 = seed_batch(
        &app.db,
        bakery.bread.id,
        bakery.loc_a.id,
        "B1",
        days_from_today(10),
        dec("5"),
        t0,
    )
    .await;
    let b2 = seed_batch(
        &app.db,
        bakery.bread.id,
        bakery.loc_a.id,
        "B2",
        days_from_today(5),
        dec("3"),
        t0 + Duration::seconds(1),
    )
    .await;
    let b3 = seed_batch(
        &app.db,
        bakery.bread.id,
        bakery.loc_b.id,
        "B3",
        days_from_today(5),
        dec("2"),
        t0 + Duration::seconds(2),
    )
    .await;

    let order = draft_sale(&app, &bakery).await;
    let line = app
        .core
        .sales
        .add_line(order.id, bakery.bread.id, dec("7"))
        .await
        .unwrap();

    let consumptions = app
        .core
        .sales
        .confirm(order.id, Some("clerk".into()))
        .await
        .unwrap();

    // B2 fully (3), then B3 fully (2), then B1 partially (2).
    assert_eq!(consumptions.len(), 3);
    assert_eq!(consumptions[0].product_batch_id, b2.id);
    assert_eq!(consumptions[0].quantity, dec("3"));
    assert_eq!(consumptions[1].product_batch_id, b3.id);
    assert_eq!(consumptions[1].quantity, dec("2"));
    assert_eq!(consumptions[2].product_batch_id, b1.id);
    assert_eq!(consumptions[2].quantity, dec("2"));
    for consumption in &consumptions {
        assert_eq!(consumption.sales_order_line_id, line.id);
        assert_eq!(consumption.created_by.as_deref(), Some("clerk"));
    }

    assert_eq!(available(&app, b2.id).await, Decimal::ZERO);
    assert_eq!(available(&app, b3.id).await, Decimal::ZERO);
    assert_eq!(available(&app, b1.id).await, dec("3"));
}

#[tokio::test]
async fn expired_batches_are_never_eligible() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;

    let expired = seed_batch(
        &app.db,
        bakery.bread.id,
        bakery.loc_a.id,
        "OLD",
        days_from_today(-1),
        dec("5"),
        Utc::now(),
    )
    .await;

    let order = draft_sale(&app, &bakery).await;
    app.core
        .sales
        .add_line(order.id, bakery.bread.id, dec("3"))
        .await
        .unwrap();

    let err = app.core.sales.confirm(order.id, None).await.unwrap_err();
    match err {
        ServiceError::InsufficientStock(shortfalls) => {
            assert_eq!(shortfalls.len(), 1);
            assert_eq!(shortfalls[0].item, "sourdough");
            assert_eq!(shortfalls[0].required, dec("3"));
            assert_eq!(shortfalls[0].available, Decimal::ZERO);
        }
        other => panic!("expected InsufficientStock, got {other:?}"),
    }

    assert_eq!(available(&app, expired.id).await, dec("5"));
    assert!(app
        .core
        .sales
        .consumptions_for(order.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn confirming_twice_is_a_noop() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;

    let batch = seed_batch(
        &app.db,
        bakery.bread.id,
        bakery.loc_a.id,
        "B1",
        days_from_today(5),
        dec("10"),
        Utc::now(),
    )
    .await;

    let order = draft_sale(&app, &bakery).await;
    app.core
        .sales
        .add_line(order.id, bakery.bread.id, dec("4"))
        .await
        .unwrap();

    let first = app.core.sales.confirm(order.id, None).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(available(&app, batch.id).await, dec("6"));

    let second = app.core.sales.confirm(order.id, None).await.unwrap();
    assert!(second.is_empty(), "second confirmation must be a no-op");
    assert_eq!(available(&app, batch.id).await, dec("6"));
    assert_eq!(
        app.core.sales.consumptions_for(order.id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn an_order_without_lines_cannot_confirm() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;

    let order = draft_sale(&app, &bakery).await;
    let err = app.core.sales.confirm(order.id, None).await.unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn a_short_line_rolls_back_the_whole_order() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;

    let cake = common::seed_product(&app.db, bakery.tenant.id, "cake", bakery.kg.id, 5).await;
    let bread_batch = seed_batch(
        &app.db,
        bakery.bread.id,
        bakery.loc_a.id,
        "BREAD",
        days_from_today(5),
        dec("10"),
        Utc::now(),
    )
    .await;
    let cake_batch = seed_batch(
        &app.db,
        cake.id,
        bakery.loc_a.id,
        "CAKE",
        days_from_today(5),
        dec("1"),
        Utc::now(),
    )
    .await;

    let order = draft_sale(&app, &bakery).await;
    app.core
        .sales
        .add_line(order.id, bakery.bread.id, dec("4"))
        .await
        .unwrap();
    app.core
        .sales
        .add_line(order.id, cake.id, dec("2"))
        .await
        .unwrap();

    let err = app.core.sales.confirm(order.id, None).await.unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(_));

    // Nothing was drawn from either product.
    assert_eq!(available(&app, bread_batch.id).await, dec("10"));
    assert_eq!(available(&app, cake_batch.id).await, dec("1"));
    assert!(app
        .core
        .sales
        .consumptions_for(order.id)
        .await
        .unwrap()
        .is_empty());

    let stored = bakeline_core::entities::sales_order::Entity::find_by_id(order.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.order_status().unwrap(), SalesOrderStatus::Draft);
}

#[tokio::test]
async fn one_line_can_draw_from_many_batches_with_one_audit_row_each() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;

    let t0 = Utc::now();
    seed_batch(&app.db, bakery.bread.id, bakery.loc_a.id, "B1", days_from_today(2), dec("1.5"), t0).await;
    seed_batch(
        &app.db,
        bakery.bread.id,
        bakery.loc_a.id,
        "B2",
        days_from_today(3),
        dec("1.5"),
        t0 + Duration::seconds(1),
    )
    .await;
    seed_batch(
        &app.db,
        bakery.bread.id,
        bakery.loc_b.id,
        "B3",
        days_from_today(4),
        dec("5"),
        t0 + Duration::seconds(2),
    )
    .await;

    let order = draft_sale(&app, &bakery).await;
    app.core
        .sales
        .add_line(order.id, bakery.bread.id, dec("4"))
        .await
        .unwrap();
    let consumptions = app.core.sales.confirm(order.id, None).await.unwrap();

    let quantities: Vec<Decimal> = consumptions.iter().map(|c| c.quantity).collect();
    assert_eq!(quantities, vec![dec("1.5"), dec("1.5"), dec("1")]);
    assert_eq!(
        quantities.iter().copied().sum::<Decimal>(),
        dec("4"),
        "audit rows account for the full line"
    );
}

#[tokio::test]
async fn batches_in_other_warehouses_are_invisible_to_the_order() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;

    let annex = app
        .core
        .tenancy
        .create_warehouse(bakery.tenant.id, "Annex".into(), None, false)
        .await
        .unwrap();
    let annex_shelf = app
        .core
        .tenancy
        .create_location(annex.id, "Shelf".into())
        .await
        .unwrap();
    seed_batch(
        &app.db,
        bakery.bread.id,
        annex_shelf.id,
        "FAR",
        days_from_today(5),
        dec("50"),
        Utc::now(),
    )
    .await;

    let order = draft_sale(&app, &bakery).await;
    app.core
        .sales
        .add_line(order.id, bakery.bread.id, dec("1"))
        .await
        .unwrap();

    let err = app.core.sales.confirm(order.id, None).await.unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock(_));
}

#[tokio::test]
async fn expiry_reports_split_near_from_expired() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;

    let t0 = Utc::now();
    let near = seed_batch(&app.db, bakery.bread.id, bakery.loc_a.id, "NEAR", days_from_today(1), dec("2"), t0).await;
    let later =
        seed_batch(&app.db, bakery.bread.id, bakery.loc_a.id, "LATER", days_from_today(6), dec("2"), t0).await;
    let gone = seed_batch(&app.db, bakery.bread.id, bakery.loc_a.id, "GONE", days_from_today(-2), dec("2"), t0).await;
    // Fully consumed batches drop out of both reports.
    seed_batch(&app.db, bakery.bread.id, bakery.loc_a.id, "EMPTY", days_from_today(-1), dec("0"), t0).await;

    let near_report = app.core.sales.batches_near_expiry(bakery.tenant.id, 2).await.unwrap();
    let near_codes: Vec<&str> = near_report.iter().map(|b| b.code.as_str()).collect();
    assert_eq!(near_codes, vec!["NEAR"]);
    assert_eq!(near_report[0].id, near.id);

    let wide_report = app.core.sales.batches_near_expiry(bakery.tenant.id, 7).await.unwrap();
    let wide_codes: Vec<&str> = wide_report.iter().map(|b| b.code.as_str()).collect();
    assert_eq!(wide_codes, vec!["NEAR", "LATER"]);
    assert_eq!(wide_report[1].id, later.id);

    let expired_report = app.core.sales.expired_batches(bakery.tenant.id).await.unwrap();
    let expired_codes: Vec<&str> = expired_report.iter().map(|b| b.code.as_str()).collect();
    assert_eq!(expired_codes, vec!["GONE"]);
    assert_eq!(expired_report[0].id, gone.id);
}

#[tokio::test]
async fn produced_batches_flow_straight_into_sales() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;

    receipt(&app, bakery.flour.id, bakery.loc_a.id, dec("10")).await;
    receipt(&app, bakery.yeast.id, bakery.loc_a.id, dec("2")).await;

    let production_order = app
        .core
        .production
        .create_order(
            bakery.bread.id,
            bakery.recipe.id,
            bakery.warehouse.id,
            dec("2"),
            None,
            Some("baker".into()),
        )
        .await
        .unwrap();
    let batch = app
        .core
        .production
        .execute(production_order.id, Some("baker".into()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch.available_quantity, dec("20"));

    let order = draft_sale(&app, &bakery).await;
    app.core
        .sales
        .add_line(order.id, bakery.bread.id, dec("12"))
        .await
        .unwrap();
    let consumptions = app.core.sales.confirm(order.id, Some("clerk".into())).await.unwrap();

    assert_eq!(consumptions.len(), 1);
    assert_eq!(consumptions[0].product_batch_id, batch.id);
    assert_eq!(consumptions[0].quantity, dec("12"));
    assert_eq!(available(&app, batch.id).await, dec("8"));
}
