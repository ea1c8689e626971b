//! Repository-level integration tests: monitoring predicate, batch index
//! correspondence and ledger uniqueness.

mod common;

use rust_decimal::Decimal;
use serial_test::serial;

use common::{build_uow, create_test_user, get_test_pool, luhn_code, unique};
use loyalty_rs::models::{OrderStatus, TxDirection};
use loyalty_rs::repos::balance_repo::NewBalanceTransaction;
use loyalty_rs::repos::order_repo::{AttemptSchedule, OrderAccrualUpdate};
use loyalty_rs::repos::{BalanceRepo, OrderRepo, RepoError, UserRepo, BALANCE_REPO, ORDER_REPO, USER_REPO};

#[tokio::test]
#[serial]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn order_code_is_globally_unique() {
    let pool = get_test_pool().await;
    let uow = build_uow(pool.clone());
    let orders: OrderRepo = uow.repository(ORDER_REPO).unwrap();

    let first_user = create_test_user(&pool, &unique("uniq_a")).await;
    let second_user = create_test_user(&pool, &unique("uniq_b")).await;
    let code = luhn_code();

    orders.create(first_user, &code).await.unwrap();

    // Same code fails for the owner and for anyone else.
    assert!(matches!(
        orders.create(first_user, &code).await,
        Err(RepoError::DuplicateKey)
    ));
    assert!(matches!(
        orders.create(second_user, &code).await,
        Err(RepoError::DuplicateKey)
    ));
}

#[tokio::test]
#[serial]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn monitoring_returns_only_due_non_terminal_orders() {
    let pool = get_test_pool().await;
    let uow = build_uow(pool.clone());
    let orders: OrderRepo = uow.repository(ORDER_REPO).unwrap();

    let user_id = create_test_user(&pool, &unique("monitoring")).await;

    let due = orders.create(user_id, &luhn_code()).await.unwrap();
    let processed = orders.create(user_id, &luhn_code()).await.unwrap();
    let invalid = orders.create(user_id, &luhn_code()).await.unwrap();
    let not_due_yet = orders.create(user_id, &luhn_code()).await.unwrap();

    for result in orders
        .batch_update_with_accrual(&[
            OrderAccrualUpdate {
                id: processed.id,
                status: OrderStatus::Processed,
                accrual: Decimal::from(10),
            },
            OrderAccrualUpdate {
                id: invalid.id,
                status: OrderStatus::Invalid,
                accrual: Decimal::ZERO,
            },
        ])
        .await
    {
        result.unwrap();
    }

    let far_future = chrono::Utc::now() + chrono::Duration::hours(6);
    for result in orders
        .batch_increment_attempts(&[AttemptSchedule {
            id: not_due_yet.id,
            next_attempt_at: far_future,
        }])
        .await
    {
        result.unwrap();
    }

    let monitored = orders.get_for_monitoring(1000).await.unwrap();
    let ids: Vec<i64> = monitored.iter().map(|o| o.id).collect();

    assert!(ids.contains(&due.id));
    assert!(!ids.contains(&processed.id), "terminal order was polled");
    assert!(!ids.contains(&invalid.id), "terminal order was polled");
    assert!(!ids.contains(&not_due_yet.id), "future order was polled");
}

#[tokio::test]
#[serial]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn batch_results_keep_index_correspondence() {
    let pool = get_test_pool().await;
    let uow = build_uow(pool.clone());
    let orders: OrderRepo = uow.repository(ORDER_REPO).unwrap();

    let user_id = create_test_user(&pool, &unique("batch_idx")).await;
    let first = orders.create(user_id, &luhn_code()).await.unwrap();
    let second = orders.create(user_id, &luhn_code()).await.unwrap();

    // Middle element targets a row that does not exist.
    let updates = [
        OrderAccrualUpdate {
            id: first.id,
            status: OrderStatus::Processing,
            accrual: Decimal::ZERO,
        },
        OrderAccrualUpdate {
            id: -1,
            status: OrderStatus::Processing,
            accrual: Decimal::ZERO,
        },
        OrderAccrualUpdate {
            id: second.id,
            status: OrderStatus::Processing,
            accrual: Decimal::ZERO,
        },
    ];

    let results = orders.batch_update_with_accrual(&updates).await;
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].as_ref().unwrap().id, first.id);
    assert!(matches!(results[1], Err(RepoError::NotFound)));
    assert_eq!(results[2].as_ref().unwrap().id, second.id);
}

#[tokio::test]
#[serial]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn attempts_are_incremented_by_the_repository() {
    let pool = get_test_pool().await;
    let uow = build_uow(pool.clone());
    let orders: OrderRepo = uow.repository(ORDER_REPO).unwrap();

    let user_id = create_test_user(&pool, &unique("attempts")).await;
    let order = orders.create(user_id, &luhn_code()).await.unwrap();
    assert_eq!(order.attempts, 0);

    let next = chrono::Utc::now() + chrono::Duration::seconds(30);
    for result in orders
        .batch_increment_attempts(&[AttemptSchedule {
            id: order.id,
            next_attempt_at: next,
        }])
        .await
    {
        result.unwrap();
    }

    let reloaded = orders.find_by_code(&order.order_code).await.unwrap();
    assert_eq!(reloaded.attempts, 1);
    assert!(reloaded.next_attempt_at > chrono::Utc::now());
}

#[tokio::test]
#[serial]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn at_most_one_debit_per_order() {
    let pool = get_test_pool().await;
    let uow = build_uow(pool.clone());
    let orders: OrderRepo = uow.repository(ORDER_REPO).unwrap();
    let balances: BalanceRepo = uow.repository(BALANCE_REPO).unwrap();

    let user_id = create_test_user(&pool, &unique("one_debit")).await;
    let order = orders.create(user_id, &luhn_code()).await.unwrap();

    let debit = NewBalanceTransaction {
        user_id,
        order_id: order.id,
        order_code: order.order_code.clone(),
        direction: TxDirection::Debit,
        amount: Decimal::from(100),
    };

    let results = balances.batch_create(&[debit.clone(), debit.clone()]).await;
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(RepoError::DuplicateKey)));

    let sums = balances.sum_by_user(user_id).await.unwrap();
    assert_eq!(sums.debit, Decimal::from(100));
    assert_eq!(sums.credit, Decimal::ZERO);
}

#[tokio::test]
#[serial]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn duplicate_username_is_rejected() {
    let pool = get_test_pool().await;
    let uow = build_uow(pool.clone());
    let users: UserRepo = uow.repository(USER_REPO).unwrap();

    let username = unique("dup_user");
    users.create(&username, "hash").await.unwrap();

    assert!(matches!(
        users.create(&username, "hash").await,
        Err(RepoError::DuplicateKey)
    ));

    let found = users.find_by_username(&username).await.unwrap();
    assert_eq!(found.username, username);
}
