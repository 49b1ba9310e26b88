//! Integration tests for the full redemption pipeline.
//!
//! Tests: Service → Quote → Ledger → Store → EventBus
//!
//! Verifies:
//! - Successful redemptions debit, decrement and record exactly one order
//! - Rejected redemptions change nothing
//! - Concurrent redemptions of the last unit: exactly one succeeds
//! - Cancellation refunds and restocks atomically
//! - Cart checkout in both modes

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::Value as JsonValue;
    use uuid::Uuid;

    use vault_accounts::{Account, AccountCommand, EnrollAccount};
    use vault_catalog::{Product, ProductDetails};
    use vault_core::{
        AccountId, Aggregate, AggregateRoot, Credits, ExpectedVersion, OrderId, ProductId,
    };
    use vault_events::{EventBus, EventEnvelope, InMemoryEventBus};
    use vault_redemption::{
        CheckoutMode, Entity, OrderStatus, RedeemLine, RedeemRequest, RedemptionError,
    };

    use crate::services::{CartCheckout, NewProduct, VaultServices};
    use crate::store::{AggregateStore, InMemoryVaultStore, Ledger, OrderFilter, OrderStore};

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

    struct Harness {
        store: Arc<InMemoryVaultStore>,
        bus: Bus,
        services: VaultServices<InMemoryVaultStore, Bus>,
        admin: AccountId,
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryVaultStore::new());
        let bus: Bus = Arc::new(InMemoryEventBus::new());

        // The first admin has to be seeded directly: enrollment needs an admin.
        let admin_id = AccountId::new();
        let mut admin = Account::empty(admin_id);
        let events = admin
            .handle(&AccountCommand::EnrollAccount(EnrollAccount {
                account_id: admin_id,
                email: "admin@vault.test".to_string(),
                display_name: "Vault Admin".to_string(),
                initial_balance: Credits::ZERO,
                is_admin: true,
                occurred_at: Utc::now(),
            }))
            .unwrap();
        for e in &events {
            admin.apply(e);
        }
        AggregateStore::<Account>::save(&*store, &admin, ExpectedVersion::NoRecord)
            .await
            .unwrap();

        let services = VaultServices::new(Arc::clone(&store), Arc::clone(&bus));
        Harness {
            store,
            bus,
            services,
            admin: admin_id,
        }
    }

    impl Harness {
        async fn student(&self, balance: u64) -> AccountId {
            let email = format!("{}@uni.edu", Uuid::now_v7().simple());
            self.services
                .accounts
                .enroll(self.admin, &email, "Student", Credits::new(balance), false)
                .await
                .unwrap()
                .id_typed()
        }

        async fn product(&self, title: &str, price: u64, stock: u32) -> ProductId {
            self.services
                .catalog
                .create_product(
                    self.admin,
                    NewProduct {
                        details: ProductDetails {
                            title: title.to_string(),
                            description: String::new(),
                            image_ref: None,
                            category: "merch".to_string(),
                        },
                        price: Credits::new(price),
                        initial_stock: stock,
                        visible: true,
                    },
                )
                .await
                .unwrap()
                .id_typed()
        }

        async fn account(&self, id: AccountId) -> Account {
            AggregateStore::<Account>::load(&*self.store, id)
                .await
                .unwrap()
                .unwrap()
        }

        async fn balance(&self, id: AccountId) -> Credits {
            self.account(id).await.balance()
        }

        async fn stock(&self, id: ProductId) -> u32 {
            AggregateStore::<Product>::load(&*self.store, id)
                .await
                .unwrap()
                .unwrap()
                .stock()
        }

        async fn order_count(&self, account_id: AccountId) -> usize {
            self.store.list_for_account(account_id).await.unwrap().len()
        }
    }

    fn single(account_id: AccountId, product_id: ProductId, quantity: u32) -> RedeemRequest {
        RedeemRequest::single(account_id, product_id, quantity, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn exact_balance_buys_the_last_unit() {
        let h = harness().await;
        let student = h.student(500).await;
        let product = h.product("Founders hoodie", 500, 1).await;

        let receipt = h
            .services
            .redemption
            .redeem(&single(student, product, 1))
            .await
            .unwrap();

        assert_eq!(receipt.new_balance, Credits::ZERO);
        assert_eq!(receipt.order.status(), OrderStatus::Pending);
        assert_eq!(receipt.order.total(), Credits::new(500));
        assert_eq!(receipt.order.lines()[0].unit_price, Credits::new(500));
        assert_eq!(h.balance(student).await, Credits::ZERO);
        assert_eq!(h.stock(product).await, 0);
        assert_eq!(h.order_count(student).await, 1);
    }

    #[tokio::test]
    async fn insufficient_funds_changes_nothing() {
        let h = harness().await;
        let student = h.student(100).await;
        let product = h.product("Desk lamp", 500, 5).await;

        let err = h
            .services
            .redemption
            .redeem(&single(student, product, 1))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            RedemptionError::InsufficientFunds {
                required: Credits::new(500),
                available: Credits::new(100),
            }
        );
        assert_eq!(h.balance(student).await, Credits::new(100));
        assert_eq!(h.stock(product).await, 5);
        assert_eq!(h.order_count(student).await, 0);
    }

    #[tokio::test]
    async fn out_of_stock_changes_nothing() {
        let h = harness().await;
        let student = h.student(10_000).await;
        let product = h.product("Sticker pack", 100, 0).await;

        let err = h
            .services
            .redemption
            .redeem(&single(student, product, 1))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            RedemptionError::OutOfStock {
                product_id: product,
                requested: 1,
                available: 0,
            }
        );
        assert_eq!(h.balance(student).await, Credits::new(10_000));
        assert_eq!(h.stock(product).await, 0);
        assert_eq!(h.order_count(student).await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_redemptions_of_the_last_unit() {
        let h = harness().await;
        let student = h.student(1_000).await;
        let product = h.product("Signed poster", 100, 1).await;

        let spawn = |engine: crate::services::RedemptionEngine<InMemoryVaultStore, Bus>| {
            tokio::spawn(async move { engine.redeem(&single(student, product, 1)).await })
        };
        let first = spawn(h.services.redemption.clone());
        let second = spawn(h.services.redemption.clone());
        let results = [first.await.unwrap(), second.await.unwrap()];

        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        let failure = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(matches!(
            failure,
            RedemptionError::OutOfStock { available: 0, .. }
        ));

        assert_eq!(h.balance(student).await, Credits::new(900));
        assert_eq!(h.stock(product).await, 0);
        assert_eq!(h.order_count(student).await, 1);
    }

    #[tokio::test]
    async fn stale_plan_after_price_change_is_a_conflict() {
        let h = harness().await;
        let student = h.student(1_000).await;
        let hoodie = h.product("Hoodie", 100, 5).await;

        let plan = h
            .services
            .redemption
            .quote(&single(student, hoodie, 1))
            .await
            .unwrap()
            .into_plan(OrderId::new())
            .unwrap();
        h.services
            .catalog
            .change_price(h.admin, hoodie, Credits::new(120))
            .await
            .unwrap();

        let err = h.store.commit_redemption(&plan).await.unwrap_err();
        assert!(matches!(err, RedemptionError::Conflict(_)));
        assert_eq!(h.balance(student).await, Credits::new(1_000));
        assert_eq!(h.stock(hoodie).await, 5);
        assert_eq!(h.order_count(student).await, 0);
    }

    #[tokio::test]
    async fn stale_plan_after_stock_drained_is_out_of_stock() {
        let h = harness().await;
        let student = h.student(1_000).await;
        let hoodie = h.product("Hoodie", 100, 2).await;

        let plan = h
            .services
            .redemption
            .quote(&single(student, hoodie, 2))
            .await
            .unwrap()
            .into_plan(OrderId::new())
            .unwrap();
        h.services
            .redemption
            .redeem(&single(student, hoodie, 1))
            .await
            .unwrap();

        let err = h.store.commit_redemption(&plan).await.unwrap_err();
        assert_eq!(
            err,
            RedemptionError::OutOfStock {
                product_id: hoodie,
                requested: 2,
                available: 1,
            }
        );
        assert_eq!(h.balance(student).await, Credits::new(900));
        assert_eq!(h.stock(hoodie).await, 1);
        assert_eq!(h.order_count(student).await, 1);
    }

    #[tokio::test]
    async fn multi_line_redemption_is_all_or_nothing() {
        let h = harness().await;
        let student = h.student(1_000).await;
        let mug = h.product("Mug", 50, 10).await;
        let cap = h.product("Cap", 70, 1).await;

        let request = RedeemRequest::new(
            student,
            [RedeemLine::new(mug, 2), RedeemLine::new(cap, 2)],
            Utc::now(),
        )
        .unwrap();
        let err = h.services.redemption.redeem(&request).await.unwrap_err();
        assert!(matches!(err, RedemptionError::OutOfStock { product_id, .. } if product_id == cap));
        assert_eq!(h.stock(mug).await, 10);
        assert_eq!(h.balance(student).await, Credits::new(1_000));

        let request = RedeemRequest::new(
            student,
            [RedeemLine::new(mug, 2), RedeemLine::new(cap, 1), RedeemLine::new(mug, 1)],
            Utc::now(),
        )
        .unwrap();
        let receipt = h.services.redemption.redeem(&request).await.unwrap();
        assert_eq!(receipt.order.lines().len(), 2);
        assert_eq!(receipt.order.total(), Credits::new(220));
        assert_eq!(receipt.new_balance, Credits::new(780));
        assert_eq!(h.stock(mug).await, 7);
        assert_eq!(h.stock(cap).await, 0);
    }

    #[tokio::test]
    async fn missing_hidden_and_blocked_are_rejected() {
        let h = harness().await;
        let student = h.student(1_000).await;
        let product = h.product("Notebook", 10, 3).await;

        let missing = ProductId::new();
        let err = h
            .services
            .redemption
            .redeem(&single(student, missing, 1))
            .await
            .unwrap_err();
        assert_eq!(err, RedemptionError::NotFound(Entity::Product(missing)));

        let err = h
            .services
            .redemption
            .redeem(&single(AccountId::new(), product, 1))
            .await
            .unwrap_err();
        assert_eq!(err, RedemptionError::NotFound(Entity::Account));

        h.services
            .catalog
            .set_visibility(h.admin, product, false)
            .await
            .unwrap();
        let err = h
            .services
            .redemption
            .redeem(&single(student, product, 1))
            .await
            .unwrap_err();
        assert_eq!(err, RedemptionError::NotFound(Entity::Product(product)));

        h.services
            .catalog
            .set_visibility(h.admin, product, true)
            .await
            .unwrap();
        h.services
            .accounts
            .set_access(h.admin, student, false)
            .await
            .unwrap();
        let err = h
            .services
            .redemption
            .redeem(&single(student, product, 1))
            .await
            .unwrap_err();
        assert_eq!(err, RedemptionError::Forbidden);

        assert_eq!(h.stock(product).await, 3);
        assert_eq!(h.balance(student).await, Credits::new(1_000));
    }

    #[tokio::test]
    async fn quote_is_side_effect_free() {
        let h = harness().await;
        let student = h.student(300).await;
        let product = h.product("Water bottle", 120, 4).await;

        let quote = h
            .services
            .redemption
            .quote(&single(student, product, 2))
            .await
            .unwrap();
        assert_eq!(quote.total, Credits::new(240));
        assert_eq!(quote.balance_after, Credits::new(60));
        assert_eq!(h.stock(product).await, 4);
        assert_eq!(h.balance(student).await, Credits::new(300));
    }

    #[tokio::test]
    async fn captured_price_survives_price_changes() {
        let h = harness().await;
        let student = h.student(200).await;
        let product = h.product("Tote bag", 50, 5).await;

        let receipt = h
            .services
            .redemption
            .redeem(&single(student, product, 1))
            .await
            .unwrap();
        h.services
            .catalog
            .change_price(h.admin, product, Credits::new(80))
            .await
            .unwrap();

        let order = h
            .services
            .redemption
            .order(receipt.order.id_typed())
            .await
            .unwrap();
        assert_eq!(order.lines()[0].unit_price, Credits::new(50));
        assert_eq!(order.lines()[0].title, "Tote bag");
        assert_eq!(order.total(), Credits::new(50));
    }

    #[tokio::test]
    async fn cancellation_refunds_and_restocks() {
        let h = harness().await;
        let student = h.student(100).await;
        let product = h.product("Beanie", 30, 5).await;

        let receipt = h
            .services
            .redemption
            .redeem(&single(student, product, 2))
            .await
            .unwrap();
        assert_eq!(h.balance(student).await, Credits::new(40));
        assert_eq!(h.stock(product).await, 3);

        let order_id = receipt.order.id_typed();
        let err = h
            .services
            .redemption
            .cancel(student, order_id)
            .await
            .unwrap_err();
        assert_eq!(err, RedemptionError::Forbidden);

        let cancellation = h
            .services
            .redemption
            .cancel(h.admin, order_id)
            .await
            .unwrap();
        assert_eq!(cancellation.refunded, Credits::new(60));
        assert_eq!(cancellation.new_balance, Credits::new(100));
        assert_eq!(cancellation.order.status(), OrderStatus::Cancelled);
        assert_eq!(h.balance(student).await, Credits::new(100));
        assert_eq!(h.stock(product).await, 5);

        let err = h
            .services
            .redemption
            .cancel(h.admin, order_id)
            .await
            .unwrap_err();
        assert!(matches!(err, RedemptionError::Conflict(_)));
        assert_eq!(h.balance(student).await, Credits::new(100));
    }

    #[tokio::test]
    async fn status_transitions_are_admin_only_and_terminal() {
        let h = harness().await;
        let student = h.student(100).await;
        let product = h.product("Pin", 5, 10).await;
        let order_id = h
            .services
            .redemption
            .redeem(&single(student, product, 1))
            .await
            .unwrap()
            .order
            .id_typed();

        let err = h
            .services
            .redemption
            .transition_status(student, order_id, OrderStatus::Fulfilled)
            .await
            .unwrap_err();
        assert_eq!(err, RedemptionError::Forbidden);

        let order = h
            .services
            .redemption
            .transition_status(h.admin, order_id, OrderStatus::Fulfilled)
            .await
            .unwrap();
        assert_eq!(order.status(), OrderStatus::Fulfilled);
        assert_eq!(order.history().len(), 2);
        assert_eq!(order.history()[1].changed_by, Some(h.admin));

        let err = h
            .services
            .redemption
            .transition_status(h.admin, order_id, OrderStatus::Delivered)
            .await
            .unwrap_err();
        assert!(matches!(err, RedemptionError::Conflict(_)));

        let missing = OrderId::new();
        let err = h
            .services
            .redemption
            .transition_status(h.admin, missing, OrderStatus::Delivered)
            .await
            .unwrap_err();
        assert_eq!(err, RedemptionError::NotFound(Entity::Order(missing)));

        let fulfilled = h
            .services
            .redemption
            .orders(OrderFilter {
                status: Some(OrderStatus::Fulfilled),
            })
            .await
            .unwrap();
        assert_eq!(fulfilled.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_status_goes_through_refund() {
        let h = harness().await;
        let student = h.student(100).await;
        let product = h.product("Lanyard", 25, 2).await;
        let order_id = h
            .services
            .redemption
            .redeem(&single(student, product, 2))
            .await
            .unwrap()
            .order
            .id_typed();

        let order = h
            .services
            .redemption
            .transition_status(h.admin, order_id, OrderStatus::Cancelled)
            .await
            .unwrap();
        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert_eq!(h.balance(student).await, Credits::new(100));
        assert_eq!(h.stock(product).await, 2);
    }

    #[tokio::test]
    async fn orders_outlive_deleted_products_and_accounts() {
        let h = harness().await;
        let student = h.student(100).await;
        let kept = h.product("Keychain", 10, 5).await;
        let dropped = h.product("Limited print", 20, 5).await;

        let request = RedeemRequest::new(
            student,
            [RedeemLine::new(kept, 1), RedeemLine::new(dropped, 1)],
            Utc::now(),
        )
        .unwrap();
        let order_id = h
            .services
            .redemption
            .redeem(&request)
            .await
            .unwrap()
            .order
            .id_typed();

        h.services.catalog.delete(h.admin, dropped).await.unwrap();
        let cancellation = h
            .services
            .redemption
            .cancel(h.admin, order_id)
            .await
            .unwrap();
        assert_eq!(cancellation.new_balance, Credits::new(100));
        assert_eq!(h.stock(kept).await, 5);

        let second = h
            .services
            .redemption
            .redeem(&single(student, kept, 1))
            .await
            .unwrap()
            .order
            .id_typed();
        h.services.accounts.delete(h.admin, student).await.unwrap();

        let order = h.services.redemption.order(second).await.unwrap();
        assert_eq!(order.account_id(), Some(student));
        let err = h
            .services
            .redemption
            .cancel(h.admin, second)
            .await
            .unwrap_err();
        assert_eq!(err, RedemptionError::NotFound(Entity::Account));
        assert_eq!(
            h.services.redemption.order(second).await.unwrap().status(),
            OrderStatus::Pending
        );
        assert_eq!(h.stock(kept).await, 4);
    }

    #[tokio::test]
    async fn all_or_nothing_checkout_redeems_the_whole_cart() {
        let h = harness().await;
        let student = h.student(500).await;
        let shirt = h.product("T-shirt", 100, 3).await;
        let socks = h.product("Socks", 20, 3).await;
        let accounts = &h.services.accounts;
        accounts.add_to_cart(student, shirt, 1).await.unwrap();
        accounts.add_to_cart(student, socks, 2).await.unwrap();

        let checkout = h
            .services
            .redemption
            .checkout_cart(student, CheckoutMode::AllOrNothing)
            .await
            .unwrap();
        let CartCheckout::AllOrNothing(receipt) = checkout else {
            panic!("expected a single receipt");
        };
        assert_eq!(receipt.order.lines().len(), 2);
        assert_eq!(receipt.new_balance, Credits::new(360));
        assert!(h.account(student).await.cart().is_empty());
    }

    #[tokio::test]
    async fn failed_all_or_nothing_checkout_keeps_the_cart() {
        let h = harness().await;
        let student = h.student(500).await;
        let shirt = h.product("T-shirt", 100, 3).await;
        let socks = h.product("Socks", 20, 1).await;
        let accounts = &h.services.accounts;
        accounts.add_to_cart(student, shirt, 1).await.unwrap();
        accounts.add_to_cart(student, socks, 2).await.unwrap();

        let err = h
            .services
            .redemption
            .checkout_cart(student, CheckoutMode::AllOrNothing)
            .await
            .unwrap_err();
        assert!(matches!(err, RedemptionError::OutOfStock { .. }));
        assert_eq!(h.account(student).await.cart().len(), 2);
        assert_eq!(h.stock(shirt).await, 3);
        assert_eq!(h.balance(student).await, Credits::new(500));
    }

    #[tokio::test]
    async fn per_line_checkout_keeps_earlier_successes() {
        let h = harness().await;
        let student = h.student(500).await;
        let shirt = h.product("T-shirt", 100, 3).await;
        let socks = h.product("Socks", 20, 1).await;
        let accounts = &h.services.accounts;
        accounts.add_to_cart(student, shirt, 1).await.unwrap();
        accounts.add_to_cart(student, socks, 2).await.unwrap();

        let checkout = h
            .services
            .redemption
            .checkout_cart(student, CheckoutMode::PerLine)
            .await
            .unwrap();
        let CartCheckout::PerLine(outcomes) = &checkout else {
            panic!("expected per-line outcomes");
        };
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(
            outcomes[1].result,
            Err(RedemptionError::OutOfStock { requested: 2, available: 1, .. })
        ));
        assert_eq!(checkout.receipts().len(), 1);

        let cart = h.account(student).await.cart().to_vec();
        assert_eq!(cart.len(), 1);
        assert_eq!(cart[0].product_id, socks);
        assert_eq!(h.balance(student).await, Credits::new(400));
        assert_eq!(h.order_count(student).await, 1);
    }

    #[tokio::test]
    async fn empty_cart_checkout_is_invalid() {
        let h = harness().await;
        let student = h.student(10).await;
        let err = h
            .services
            .redemption
            .checkout_cart(student, CheckoutMode::AllOrNothing)
            .await
            .unwrap_err();
        assert!(matches!(err, RedemptionError::Validation(_)));
    }

    #[tokio::test]
    async fn committed_redemption_publishes_events() {
        let h = harness().await;
        let student = h.student(100).await;
        let product = h.product("Enamel pin", 15, 4).await;
        let subscription = h.bus.subscribe();

        h.services
            .redemption
            .redeem(&single(student, product, 2))
            .await
            .unwrap();

        let envelopes = subscription.drain();
        let types: Vec<&str> = envelopes.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec![
                "accounts.account.credits_debited",
                "catalog.product.stock_decremented",
                "redemption.order.placed",
            ]
        );

        let account_version = h.account(student).await.version();
        assert_eq!(envelopes[0].sequence_number(), account_version);
        assert_eq!(envelopes[2].sequence_number(), 1);
    }

    #[tokio::test]
    async fn rejected_redemption_publishes_nothing() {
        let h = harness().await;
        let student = h.student(10).await;
        let product = h.product("Jacket", 400, 1).await;
        let subscription = h.bus.subscribe();

        h.services
            .redemption
            .redeem(&single(student, product, 1))
            .await
            .unwrap_err();
        assert!(subscription.drain().is_empty());
    }
}
