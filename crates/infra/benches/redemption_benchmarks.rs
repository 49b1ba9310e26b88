use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Runtime;
use vault_accounts::{Account, AccountCommand, EnrollAccount};
use vault_catalog::{CreateProduct, Product, ProductCommand, ProductDetails};
use vault_core::{AccountId, Aggregate, Credits, ExpectedVersion, ProductId};
use vault_events::{EventEnvelope, InMemoryEventBus};
use vault_infra::{AggregateStore, InMemoryVaultStore, NewProduct, VaultServices};
use vault_redemption::{Quote, RedeemLine, RedeemRequest};

type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

fn details(title: &str) -> ProductDetails {
    ProductDetails {
        title: title.to_string(),
        description: String::new(),
        image_ref: None,
        category: "bench".to_string(),
    }
}

fn account(balance: u64, is_admin: bool) -> Account {
    let id = AccountId::new();
    let mut account = Account::empty(id);
    let events = account
        .handle(&AccountCommand::EnrollAccount(EnrollAccount {
            account_id: id,
            email: format!("{id}@bench.test"),
            display_name: "Bench".to_string(),
            initial_balance: Credits::new(balance),
            is_admin,
            occurred_at: Utc::now(),
        }))
        .unwrap();
    for e in &events {
        account.apply(e);
    }
    account
}

fn product(price: u64, stock: u32) -> Product {
    let id = ProductId::new();
    let mut product = Product::empty(id);
    let events = product
        .handle(&ProductCommand::CreateProduct(CreateProduct {
            product_id: id,
            details: details("Bench item"),
            price: Credits::new(price),
            initial_stock: stock,
            visible: true,
            occurred_at: Utc::now(),
        }))
        .unwrap();
    for e in &events {
        product.apply(e);
    }
    product
}

/// Store with an admin and one wealthy student; returns the services and both ids.
fn setup(rt: &Runtime) -> (VaultServices<InMemoryVaultStore, Bus>, AccountId, AccountId) {
    let store = Arc::new(InMemoryVaultStore::new());
    let admin = account(0, true);
    let student = account(u64::MAX / 2, false);
    rt.block_on(async {
        AggregateStore::<Account>::save(&*store, &admin, ExpectedVersion::NoRecord)
            .await
            .unwrap();
        AggregateStore::<Account>::save(&*store, &student, ExpectedVersion::NoRecord)
            .await
            .unwrap();
    });
    let services = VaultServices::new(store, Arc::new(InMemoryEventBus::new()));
    (services, admin.id_typed(), student.id_typed())
}

fn bench_quote(c: &mut Criterion) {
    let mut group = c.benchmark_group("quote_build");

    for lines in [1usize, 10, 50].iter() {
        group.throughput(Throughput::Elements(*lines as u64));
        group.bench_with_input(BenchmarkId::new("lines", lines), lines, |b, &size| {
            let student = account(1_000_000, false);
            let products: HashMap<ProductId, Product> = (0..size)
                .map(|_| {
                    let p = product(10, 1_000);
                    (p.id_typed(), p)
                })
                .collect();
            let request = RedeemRequest::new(
                student.id_typed(),
                products.keys().map(|id| RedeemLine::new(*id, 3)),
                Utc::now(),
            )
            .unwrap();

            b.iter(|| black_box(Quote::build(&request, Some(&student), &products).unwrap()));
        });
    }

    group.finish();
}

fn bench_redeem(c: &mut Criterion) {
    let mut group = c.benchmark_group("redeem_in_memory");
    let rt = Runtime::new().unwrap();

    for lines in [1usize, 5, 20].iter() {
        group.throughput(Throughput::Elements(*lines as u64));
        group.bench_with_input(BenchmarkId::new("lines", lines), lines, |b, &size| {
            let (services, admin, student) = setup(&rt);
            let product_ids: Vec<ProductId> = rt.block_on(async {
                let mut ids = Vec::with_capacity(size);
                for i in 0..size {
                    let p = services
                        .catalog
                        .create_product(
                            admin,
                            NewProduct {
                                details: details(&format!("Item {i}")),
                                price: Credits::new(1),
                                initial_stock: u32::MAX,
                                visible: true,
                            },
                        )
                        .await
                        .unwrap();
                    ids.push(p.id_typed());
                }
                ids
            });

            b.iter(|| {
                let request = RedeemRequest::new(
                    student,
                    product_ids.iter().map(|id| RedeemLine::new(*id, 1)),
                    Utc::now(),
                )
                .unwrap();
                black_box(rt.block_on(services.redemption.redeem(&request)).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_quote, bench_redeem);
criterion_main!(benches);
