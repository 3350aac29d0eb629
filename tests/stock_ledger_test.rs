mod common;

use assert_matches::assert_matches;
use bakeline_core::{
    entities::stock_movement::MovementKind,
    errors::ServiceError,
    services::stock_ledger::{AmendMovement, MovementHistoryFilter, NewMovement},
};
use common::{dec, receipt, seed_bakery, seed_material, seed_unit, TestApp};
use rust_decimal::Decimal;

fn movement(
    material_id: i64,
    location_id: i64,
    kind: MovementKind,
    quantity: Decimal,
) -> NewMovement {
    NewMovement {
        material_id,
        location_id,
        kind,
        quantity,
        occurred_at: None,
        note: None,
        recorded_by: Some("tester".into()),
    }
}

#[tokio::test]
async fn every_kind_applies_its_signed_quantity() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;
    let ledger = &app.core.stock_ledger;

    let steps = [
        (MovementKind::Receipt, "10", "10"),
        (MovementKind::AdjustPos, "2", "12"),
        (MovementKind::Consumption, "3", "9"),
        (MovementKind::Shrinkage, "1", "8"),
        (MovementKind::AdjustNeg, "0.5", "7.5"),
    ];

    for (kind, quantity, expected) in steps {
        ledger
            .record(movement(bakery.flour.id, bakery.loc_a.id, kind, dec(quantity)))
            .await
            .unwrap();
        assert_eq!(
            ledger.balance(bakery.loc_a.id, bakery.flour.id).await.unwrap(),
            dec(expected),
            "after {kind:?}"
        );
    }

    let history = ledger
        .movement_history(MovementHistoryFilter {
            material_id: Some(bakery.flour.id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(history.len(), 5);
}

#[tokio::test]
async fn nonpositive_quantities_are_rejected_before_any_mutation() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;
    let ledger = &app.core.stock_ledger;

    for quantity in ["0", "-1"] {
        let err = ledger
            .record(movement(
                bakery.flour.id,
                bakery.loc_a.id,
                MovementKind::Receipt,
                dec(quantity),
            ))
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::InvalidMovement(_));
    }

    assert_eq!(
        ledger.balance(bakery.loc_a.id, bakery.flour.id).await.unwrap(),
        Decimal::ZERO
    );
    let history = ledger
        .movement_history(MovementHistoryFilter::default())
        .await
        .unwrap();
    assert!(history.is_empty());
}

#[tokio::test]
async fn locations_of_another_tenant_are_rejected() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;

    let other = app
        .core
        .tenancy
        .create_tenant("Rival".into(), bakeline_core::entities::tenant::PlanTier::MultiSite)
        .await
        .unwrap();
    let other_warehouse = app
        .core
        .tenancy
        .create_warehouse(other.id, "Rival Central".into(), None, true)
        .await
        .unwrap();
    let other_location = app
        .core
        .tenancy
        .create_location(other_warehouse.id, "Shelf".into())
        .await
        .unwrap();

    let err = app
        .core
        .stock_ledger
        .record(movement(
            bakery.flour.id,
            other_location.id,
            MovementKind::Receipt,
            dec("5"),
        ))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidMovement(_));
}

#[tokio::test]
async fn amend_replays_the_delta_against_the_balance() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;
    let ledger = &app.core.stock_ledger;

    let recorded = ledger
        .record(movement(
            bakery.flour.id,
            bakery.loc_a.id,
            MovementKind::Receipt,
            dec("10"),
        ))
        .await
        .unwrap();

    // Shrink the receipt.
    ledger
        .amend(
            recorded.id,
            AmendMovement {
                quantity: Some(dec("4")),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        ledger.balance(bakery.loc_a.id, bakery.flour.id).await.unwrap(),
        dec("4")
    );

    // Flip it to an outbound kind: balance goes from +4 to -4.
    let amended = ledger
        .amend(
            recorded.id,
            AmendMovement {
                kind: Some(MovementKind::Shrinkage),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(amended.kind, "SHRINKAGE");
    assert_eq!(
        ledger.balance(bakery.loc_a.id, bakery.flour.id).await.unwrap(),
        dec("-4")
    );

    let err = ledger
        .amend(
            recorded.id,
            AmendMovement {
                quantity: Some(dec("0")),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidMovement(_));
}

#[tokio::test]
async fn retract_reverses_the_contribution_and_deletes_the_movement() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;
    let ledger = &app.core.stock_ledger;

    let received = ledger
        .record(movement(
            bakery.flour.id,
            bakery.loc_a.id,
            MovementKind::Receipt,
            dec("10"),
        ))
        .await
        .unwrap();
    let consumed = ledger
        .record(movement(
            bakery.flour.id,
            bakery.loc_a.id,
            MovementKind::Consumption,
            dec("3"),
        ))
        .await
        .unwrap();
    assert_eq!(
        ledger.balance(bakery.loc_a.id, bakery.flour.id).await.unwrap(),
        dec("7")
    );

    ledger.retract(consumed.id).await.unwrap();
    assert_eq!(
        ledger.balance(bakery.loc_a.id, bakery.flour.id).await.unwrap(),
        dec("10")
    );

    ledger.retract(received.id).await.unwrap();
    assert_eq!(
        ledger.balance(bakery.loc_a.id, bakery.flour.id).await.unwrap(),
        Decimal::ZERO
    );

    let history = ledger
        .movement_history(MovementHistoryFilter {
            material_id: Some(bakery.flour.id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(history.is_empty());

    let err = ledger.retract(consumed.id).await.unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn balance_always_equals_the_sum_of_signed_movements() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;
    let ledger = &app.core.stock_ledger;

    let first = ledger
        .record(movement(
            bakery.flour.id,
            bakery.loc_a.id,
            MovementKind::Receipt,
            dec("20"),
        ))
        .await
        .unwrap();
    ledger
        .record(movement(
            bakery.flour.id,
            bakery.loc_a.id,
            MovementKind::Consumption,
            dec("4.25"),
        ))
        .await
        .unwrap();
    ledger
        .amend(
            first.id,
            AmendMovement {
                quantity: Some(dec("18")),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let shrink = ledger
        .record(movement(
            bakery.flour.id,
            bakery.loc_a.id,
            MovementKind::Shrinkage,
            dec("0.75"),
        ))
        .await
        .unwrap();
    ledger.retract(shrink.id).await.unwrap();

    let history = ledger
        .movement_history(MovementHistoryFilter {
            material_id: Some(bakery.flour.id),
            location_id: Some(bakery.loc_a.id),
            ..Default::default()
        })
        .await
        .unwrap();
    let replayed: Decimal = history
        .iter()
        .map(|m| m.signed_quantity().unwrap())
        .sum();

    assert_eq!(
        ledger.balance(bakery.loc_a.id, bakery.flour.id).await.unwrap(),
        replayed
    );
    assert_eq!(replayed, dec("13.75"));
}

#[tokio::test]
async fn concurrent_writers_on_one_pair_lose_no_updates() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let ledger = app.core.stock_ledger.clone();
        let material_id = bakery.flour.id;
        let location_id = bakery.loc_a.id;
        tasks.push(tokio::spawn(async move {
            ledger
                .record(movement(
                    material_id,
                    location_id,
                    MovementKind::Receipt,
                    dec("1"),
                ))
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(
        app.core
            .stock_ledger
            .balance(bakery.loc_a.id, bakery.flour.id)
            .await
            .unwrap(),
        dec("10")
    );
    let history = app
        .core
        .stock_ledger
        .movement_history(MovementHistoryFilter {
            material_id: Some(bakery.flour.id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(history.len(), 10);
}

#[tokio::test]
async fn record_many_is_all_or_nothing() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;
    let ledger = &app.core.stock_ledger;

    let err = ledger
        .record_many(vec![
            movement(bakery.flour.id, bakery.loc_a.id, MovementKind::Receipt, dec("5")),
            movement(bakery.yeast.id, bakery.loc_a.id, MovementKind::Receipt, dec("-1")),
        ])
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidMovement(_));

    assert_eq!(
        ledger.balance(bakery.loc_a.id, bakery.flour.id).await.unwrap(),
        Decimal::ZERO
    );
    assert!(ledger
        .movement_history(MovementHistoryFilter::default())
        .await
        .unwrap()
        .is_empty());

    let recorded = ledger
        .record_many(vec![
            movement(bakery.flour.id, bakery.loc_a.id, MovementKind::Receipt, dec("5")),
            movement(bakery.yeast.id, bakery.loc_a.id, MovementKind::Receipt, dec("2")),
            movement(bakery.flour.id, bakery.loc_b.id, MovementKind::Receipt, dec("3")),
        ])
        .await
        .unwrap();
    assert_eq!(recorded.len(), 3);
    assert_eq!(
        ledger.balance(bakery.loc_a.id, bakery.flour.id).await.unwrap(),
        dec("5")
    );
    assert_eq!(
        ledger.balance(bakery.loc_b.id, bakery.flour.id).await.unwrap(),
        dec("3")
    );
}

#[tokio::test]
async fn warehouse_balance_aggregates_only_its_locations() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;

    receipt(&app, bakery.flour.id, bakery.loc_a.id, dec("4")).await;
    receipt(&app, bakery.flour.id, bakery.loc_b.id, dec("3")).await;

    let second_warehouse = app
        .core
        .tenancy
        .create_warehouse(bakery.tenant.id, "Annex".into(), None, false)
        .await
        .unwrap();
    let annex_shelf = app
        .core
        .tenancy
        .create_location(second_warehouse.id, "Shelf".into())
        .await
        .unwrap();
    receipt(&app, bakery.flour.id, annex_shelf.id, dec("100")).await;

    assert_eq!(
        app.core
            .stock_ledger
            .warehouse_balance(bakery.warehouse.id, bakery.flour.id)
            .await
            .unwrap(),
        dec("7")
    );
    assert_eq!(
        app.core
            .stock_ledger
            .warehouse_balance(second_warehouse.id, bakery.flour.id)
            .await
            .unwrap(),
        dec("100")
    );
}

#[tokio::test]
async fn stock_summary_flags_materials_at_or_below_minimum() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;
    let ledger = &app.core.stock_ledger;

    receipt(&app, bakery.flour.id, bakery.loc_a.id, dec("10")).await;
    ledger
        .set_reorder_minimum(bakery.loc_a.id, bakery.flour.id, dec("3"))
        .await
        .unwrap();
    // Yeast never moved; summary still lists it at zero.

    let summary = ledger.tenant_stock_summary(bakery.tenant.id).await.unwrap();
    assert_eq!(summary.len(), 2);

    let flour = summary
        .iter()
        .find(|s| s.material_id == bakery.flour.id)
        .unwrap();
    assert_eq!(flour.total_quantity, dec("10"));
    assert_eq!(flour.total_reorder_minimum, dec("3"));
    assert!(!flour.below_minimum());

    ledger
        .record(movement(
            bakery.flour.id,
            bakery.loc_a.id,
            MovementKind::Consumption,
            dec("7"),
        ))
        .await
        .unwrap();
    let summary = ledger.tenant_stock_summary(bakery.tenant.id).await.unwrap();
    let flour = summary
        .iter()
        .find(|s| s.material_id == bakery.flour.id)
        .unwrap();
    assert_eq!(flour.total_quantity, dec("3"));
    assert!(flour.below_minimum());
}

#[tokio::test]
async fn history_filters_by_kind_and_window() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;
    let ledger = &app.core.stock_ledger;

    receipt(&app, bakery.flour.id, bakery.loc_a.id, dec("10")).await;
    ledger
        .record(movement(
            bakery.flour.id,
            bakery.loc_a.id,
            MovementKind::Consumption,
            dec("2"),
        ))
        .await
        .unwrap();
    receipt(&app, bakery.yeast.id, bakery.loc_a.id, dec("1")).await;

    let consumptions = ledger
        .movement_history(MovementHistoryFilter {
            kind: Some(MovementKind::Consumption),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(consumptions.len(), 1);
    assert_eq!(consumptions[0].material_id, bakery.flour.id);

    let tomorrow = chrono::Utc::now() + chrono::Duration::days(1);
    let nothing = ledger
        .movement_history(MovementHistoryFilter {
            occurred_from: Some(tomorrow),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(nothing.is_empty());

    let limited = ledger
        .movement_history(MovementHistoryFilter {
            limit: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 2);
}

#[tokio::test]
async fn plan_limits_gate_warehouse_and_location_creation() {
    let app = TestApp::new().await;

    let tenant = app
        .core
        .tenancy
        .create_tenant(
            "Tiny Bakery".into(),
            bakeline_core::entities::tenant::PlanTier::Essential,
        )
        .await
        .unwrap();
    let warehouse = app
        .core
        .tenancy
        .create_warehouse(tenant.id, "Only".into(), None, true)
        .await
        .unwrap();

    let err = app
        .core
        .tenancy
        .create_warehouse(tenant.id, "Second".into(), None, false)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::PlanLimitExceeded(_));

    app.core
        .tenancy
        .create_location(warehouse.id, "Only Shelf".into())
        .await
        .unwrap();
    let err = app
        .core
        .tenancy
        .create_location(warehouse.id, "Second Shelf".into())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::PlanLimitExceeded(_));
}

#[tokio::test]
async fn unknown_material_is_not_found() {
    let app = TestApp::new().await;
    let bakery = seed_bakery(&app).await;
    // Material from nowhere: the unit and location exist, the material does
    // not.
    let _ = seed_unit(&app.db, "l").await;
    let _ = seed_material(&app.db, bakery.tenant.id, "salt", bakery.kg.id).await;

    let err = app
        .core
        .stock_ledger
        .record(movement(
            9999,
            bakery.loc_a.id,
            MovementKind::Receipt,
            dec("1"),
        ))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}
