//! Append-only order-loop audit log (§6 "one row per signal, containing the
//! full signal and final status"; header written on file creation only).
//! Grounded on the teacher's `ingestor.rs::harvest_tick_to_csv` append
//! pattern, generalized to the `csv` crate's header-aware `Writer` since
//! every field here is structured rather than a hand-joined string.

use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::venue::{OrderSide, VenueKind};

#[derive(Debug, Clone, Serialize)]
pub struct AuditRow {
    pub ts_ms: i64,
    pub symbol: String,
    pub maker_venue: VenueKind,
    pub taker_venue: VenueKind,
    pub maker_side: OrderSide,
    pub maker_price: Decimal,
    pub maker_qty: Decimal,
    pub is_reduce_position: bool,
    pub status: String,
    pub filled_qty: Decimal,
    pub followed_qty: Decimal,
    pub cancel_reason: Option<String>,
}

pub struct AuditLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub async fn append(&self, row: AuditRow) -> std::io::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_row_blocking(&path, &row))
            .await
            .expect("audit writer task panicked")
    }
}

fn write_row_blocking(path: &Path, row: &AuditRow) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let write_header = !path.exists();
    let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new().has_headers(write_header).from_writer(file);
    writer
        .serialize(row)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_row() -> AuditRow {
        AuditRow {
            ts_ms: 1,
            symbol: "BNB/USDT".into(),
            maker_venue: VenueKind::A,
            taker_venue: VenueKind::B,
            maker_side: OrderSide::Sell,
            maker_price: dec!(100),
            maker_qty: dec!(1),
            is_reduce_position: false,
            status: "done".into(),
            filled_qty: dec!(1),
            followed_qty: dec!(1),
            cancel_reason: None,
        }
    }

    #[tokio::test]
    async fn header_written_once_then_appended() {
        let dir = std::env::temp_dir().join(format!("xvenue-arb-audit-test-{}", std::process::id()));
        let path = dir.join("order_loop.csv");
        let _ = std::fs::remove_file(&path);

        let log = AuditLog::new(path.clone());
        log.append(sample_row()).await.unwrap();
        log.append(sample_row()).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("ts_ms,symbol"));

        let _ = std::fs::remove_file(&path);
    }
}
