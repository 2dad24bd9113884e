//! Structured output tables, each replaced wholesale by the stage that owns it.

use serde::{Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::WarehouseError;

pub const RANKED_TABLE: &str = "weather_cleaned_ranked";
pub const SUMMARY_TABLE: &str = "city_weather_summary";
pub const FORECAST_TABLE: &str = "weather_forecast";

/// Directory of JSON tables, one file per table.
#[derive(Debug, Clone)]
pub struct Warehouse {
    root: PathBuf,
}

impl Warehouse {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.root.join(format!("{table}.json"))
    }

    /// Replace the whole table. Readers see either the old rows or the new ones.
    pub async fn replace<T: Serialize>(&self, table: &str, rows: &[T]) -> Result<(), WarehouseError> {
        tokio::fs::create_dir_all(&self.root).await?;

        let body = serde_json::to_vec_pretty(rows)?;
        let path = self.table_path(table);
        let tmp = self.root.join(format!("{table}.json.tmp"));

        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(table, rows = rows.len(), path = %path.display(), "replaced table");
        Ok(())
    }

    /// Current rows of a table; a table never written reads as empty.
    pub async fn read<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>, WarehouseError> {
        match tokio::fs::read(self.table_path(table)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CitySummary;

    fn summary(city: &str) -> CitySummary {
        CitySummary { city: city.to_string(), avg_temperature: 22.0, record_count: 3 }
    }

    #[tokio::test]
    async fn replace_supersedes_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let warehouse = Warehouse::new(dir.path());

        warehouse.replace(SUMMARY_TABLE, &[summary("Delhi"), summary("Goa")]).await.unwrap();
        warehouse.replace(SUMMARY_TABLE, &[summary("Shimla")]).await.unwrap();

        let rows: Vec<CitySummary> = warehouse.read(SUMMARY_TABLE).await.unwrap();
        assert_eq!(rows, vec![summary("Shimla")]);
        assert!(!dir.path().join("city_weather_summary.json.tmp").exists());
    }

    #[tokio::test]
    async fn unwritten_table_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let rows: Vec<CitySummary> = Warehouse::new(dir.path()).read(FORECAST_TABLE).await.unwrap();
        assert!(rows.is_empty());
    }
}
