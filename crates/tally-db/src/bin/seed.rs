//! # Seed Data Generator
//!
//! Populates a cache database with a development catalog.
//!
//! ## Usage
//! ```bash
//! # Generate 2,000 items (default)
//! cargo run -p tally-db --bin seed
//!
//! # Generate custom amount
//! cargo run -p tally-db --bin seed -- --count 10000
//!
//! # Specify database path
//! cargo run -p tally-db --bin seed -- --db ./data/tally.db
//! ```
//!
//! Each item gets a code `{GROUP}-{INDEX}`, one EAN-like barcode, a price
//! and a stock figure in the `Stores - T` warehouse. A handful of customers
//! and two payment methods are added for the `Main POS` profile.

use std::env;
use std::time::Instant;

use tally_core::{CatalogItem, Customer, PaymentMethod, StockUpdate};
use tally_db::{Database, DbConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const WAREHOUSE: &str = "Stores - T";
const POS_PROFILE: &str = "Main POS";
const BATCH_SIZE: usize = 500;

/// Item groups for realistic test data
const GROUPS: &[(&str, &str, &[&str])] = &[
    (
        "BEV",
        "Beverages",
        &["Cola", "Lemon Soda", "Mineral Water", "Mango Juice", "Green Tea"],
    ),
    (
        "SNK",
        "Snacks",
        &["Salted Chips", "Masala Chips", "Chocolate Bar", "Biscuits", "Nimko"],
    ),
    (
        "DRY",
        "Dairy",
        &["Fresh Milk", "Yogurt", "Cheddar Cheese", "Butter", "Cream"],
    ),
    (
        "GRO",
        "Grocery",
        &["Basmati Rice", "Red Lentils", "Cooking Oil", "Sugar", "Flour"],
    ),
];

const SIZES: &[(&str, f64)] = &[("Small", 0.0), ("Medium", 40.0), ("Large", 90.0), ("Pack", 250.0)];

const CUSTOMERS: &[(&str, &str, &str)] = &[
    ("CUST-0001", "Walk-in Customer", ""),
    ("CUST-0002", "Ayesha Khan", "03001234567"),
    ("CUST-0003", "Bilal Ahmed", "03217654321"),
    ("CUST-0004", "Sana Malik", "03335550001"),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    let mut count: usize = 2000;
    let mut db_path = String::from("./tally_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(2000);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Tally POS Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>    Number of items to generate (default: 2000)");
                println!("  -d, --db <PATH>    Database file path (default: ./tally_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    info!(db = %db_path, count, "Seeding catalog");

    let (db, outcome) = Database::open_with_recovery(DbConfig::new(&db_path)).await?;
    info!(?outcome, "Database ready");

    let existing = db.items().count().await?;
    if existing > 0 {
        warn!(existing, "Catalog already populated, skipping seed");
        return Ok(());
    }

    let start = Instant::now();
    let items = generate_items(count);

    for chunk in items.chunks(BATCH_SIZE) {
        db.items().bulk_put(chunk).await?;

        let stock: Vec<StockUpdate> = chunk
            .iter()
            .filter_map(|item| {
                item.actual_qty
                    .map(|qty| StockUpdate::new(item.item_code.clone(), WAREHOUSE, qty))
            })
            .collect();
        db.stock().apply_quantities(&stock).await?;
    }

    let customers: Vec<Customer> = CUSTOMERS
        .iter()
        .map(|(name, full, mobile)| Customer {
            name: (*name).to_string(),
            customer_name: (*full).to_string(),
            mobile_no: (!mobile.is_empty()).then(|| (*mobile).to_string()),
            email_id: None,
        })
        .collect();
    db.customers().bulk_put(&customers).await?;

    db.payment_methods()
        .replace_for_profile(
            POS_PROFILE,
            &[
                PaymentMethod {
                    mode_of_payment: "Cash".into(),
                    pos_profile: POS_PROFILE.into(),
                    default: true,
                    payment_type: Some("Cash".into()),
                },
                PaymentMethod {
                    mode_of_payment: "Card".into(),
                    pos_profile: POS_PROFILE.into(),
                    default: false,
                    payment_type: Some("Bank".into()),
                },
            ],
        )
        .await?;

    let elapsed = start.elapsed();
    info!(
        items = items.len(),
        customers = customers.len(),
        elapsed_ms = elapsed.as_millis() as u64,
        "Seed complete"
    );

    let hits = db.items().search("cola", 10).await?;
    info!(hits = hits.len(), "Search 'cola'");

    Ok(())
}

fn generate_items(count: usize) -> Vec<CatalogItem> {
    let mut items = Vec::with_capacity(count);

    'outer: for (group_idx, (code, group, names)) in GROUPS.iter().enumerate() {
        for (name_idx, name) in names.iter().enumerate() {
            for (size_idx, (size, addon)) in SIZES.iter().enumerate() {
                if items.len() >= count {
                    break 'outer;
                }
                let seed = group_idx * 1000 + name_idx * 20 + size_idx;
                items.push(generate_item(code, group, name, size, *addon, seed));
            }
        }
    }

    // Cycle with numbered variants once the fixed combinations run out.
    let mut round = 1;
    while items.len() < count {
        let base = items.len() % (GROUPS.len() * 20);
        let (code, group, names) = GROUPS[base % GROUPS.len()];
        let name = names[base % names.len()];
        let seed = 10_000 * round + items.len();
        items.push(generate_item(
            code,
            group,
            &format!("{name} #{round}"),
            "Std",
            0.0,
            seed,
        ));
        if items.len() % (GROUPS.len() * 20) == 0 {
            round += 1;
        }
    }

    items
}

fn generate_item(code: &str, group: &str, name: &str, size: &str, addon: f64, seed: usize) -> CatalogItem {
    let price = 50.0 + ((seed * 17) % 450) as f64 + addon;

    let mut item = CatalogItem::new(format!("{code}-{seed:05}"), format!("{name} {size}"), price);
    item.item_group = Some(group.to_string());
    item.uom = Some("Nos".into());
    item.stock_uom = Some("Nos".into());
    item.warehouse = Some(WAREHOUSE.into());
    item.actual_qty = Some((seed % 101) as f64);
    item.barcodes = vec![format!("890{seed:010}")];
    item
}
