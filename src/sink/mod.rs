use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::Row;
use tracing::{debug, error, info};

use crate::bucket::Bucket;
use crate::config::Config;
use crate::queue::BucketQueue;

/// Error that terminates the sink task. There is no retry loop: the minute
/// cadence is low enough that an operator restart reconnects without
/// significant loss, and the store is assumed reliable.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// A bucket key could not be resolved against the preloaded id maps.
    #[error("unknown field key: {0}")]
    UnknownField(String),
    /// The store rejected a write.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// One `sdata` row derived from a bucket entry.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    pub timekey: u64,
    pub sensor_id: i32,
    pub field_id: i32,
    pub value: f32,
}

/// Immutable name-to-id maps, fetched once from the store at startup.
///
/// A bucket key `sensor.field` selects the sensor by prefix and the field by
/// suffix; a dotless key is a field name on the single configured sensor.
#[derive(Debug)]
pub struct IdMap {
    station_id: i32,
    sensors: HashMap<String, i32>,
    fields: HashMap<String, i32>,
    default_sensor: Option<i32>,
}

impl IdMap {
    /// Builds the map from preloaded rows. The configured default sensor,
    /// if any, must be among the station's sensors.
    pub fn new(
        station_id: i32,
        sensors: Vec<(String, i32)>,
        fields: Vec<(String, i32)>,
        default_sensor: Option<&str>,
    ) -> Result<Self> {
        let sensors: HashMap<String, i32> = sensors.into_iter().collect();

        let default_sensor = match default_sensor {
            None => None,
            Some(name) => Some(
                sensors
                    .get(name)
                    .copied()
                    .with_context(|| format!("configured sensor '{name}' not found in store"))?,
            ),
        };

        Ok(Self {
            station_id,
            sensors,
            fields: fields.into_iter().collect(),
            default_sensor,
        })
    }

    /// Fetches the station, its sensors and the field catalog.
    pub async fn load(
        pool: &MySqlPool,
        stationname: &str,
        default_sensor: Option<&str>,
    ) -> Result<Self> {
        let station_id: i32 = sqlx::query("SELECT id FROM station WHERE name = ?")
            .bind(stationname)
            .fetch_one(pool)
            .await
            .with_context(|| format!("looking up station '{stationname}'"))?
            .try_get(0)
            .context("decoding station id")?;

        let sensors = sqlx::query("SELECT name, id FROM sensor WHERE stationid = ?")
            .bind(station_id)
            .fetch_all(pool)
            .await
            .context("loading sensors")?
            .into_iter()
            .map(|row| Ok((row.try_get(0)?, row.try_get(1)?)))
            .collect::<Result<Vec<(String, i32)>, sqlx::Error>>()
            .context("decoding sensor rows")?;

        let fields = sqlx::query("SELECT name, id FROM mfield")
            .fetch_all(pool)
            .await
            .context("loading fields")?
            .into_iter()
            .map(|row| Ok((row.try_get(0)?, row.try_get(1)?)))
            .collect::<Result<Vec<(String, i32)>, sqlx::Error>>()
            .context("decoding field rows")?;

        info!(
            station = stationname,
            station_id,
            sensors = sensors.len(),
            fields = fields.len(),
            "id maps loaded",
        );

        Self::new(station_id, sensors, fields, default_sensor)
    }

    pub fn station_id(&self) -> i32 {
        self.station_id
    }

    /// Resolves a bucket key to `(sensor_id, field_id)`.
    pub fn resolve(&self, key: &str) -> Result<(i32, i32), SinkError> {
        let unknown = || SinkError::UnknownField(key.to_string());

        let (sensor_id, field_name) = match key.split_once('.') {
            Some((sensor, field)) => {
                (self.sensors.get(sensor).copied().ok_or_else(unknown)?, field)
            }
            None => (self.default_sensor.ok_or_else(unknown)?, key),
        };

        let field_id = self.fields.get(field_name).copied().ok_or_else(unknown)?;
        Ok((sensor_id, field_id))
    }

    /// Translates a bucket into its row set: one row per field.
    pub fn rows_for(&self, bucket: &Bucket) -> Result<Vec<DataRow>, SinkError> {
        let timekey = bucket.timekey();
        bucket
            .iter()
            .map(|(key, value)| {
                let (sensor_id, field_id) = self.resolve(key)?;
                Ok(DataRow {
                    timekey,
                    sensor_id,
                    field_id,
                    value,
                })
            })
            .collect()
    }
}

/// Writes one bucket: one `sdata` row per field.
async fn store(pool: &MySqlPool, ids: &IdMap, bucket: &Bucket) -> Result<usize, SinkError> {
    let rows = ids.rows_for(bucket)?;

    for row in &rows {
        sqlx::query("INSERT INTO sdata (timekey, sensorid, fieldid, value) VALUES (?, ?, ?, ?)")
            .bind(row.timekey as i64)
            .bind(row.sensor_id)
            .bind(row.field_id)
            .bind(row.value)
            .execute(pool)
            .await?;
    }

    Ok(rows.len())
}

/// Consumer loop: drain the queue until it closes or a write fails.
async fn run(pool: MySqlPool, ids: IdMap, queue: Arc<BucketQueue>) {
    info!("sink writer started");

    loop {
        let bucket = match queue.extract().await {
            Ok(bucket) => bucket,
            Err(_closed) => break,
        };

        let timekey = bucket.timekey();
        match store(&pool, &ids, &bucket).await {
            Ok(rows) => debug!(timekey, rows, "bucket stored"),
            Err(e) => {
                error!(timekey, error = %e, "store failed, sink terminating");
                break;
            }
        }
    }

    pool.close().await;
    info!("sink writer stopped");
}

/// Handle of the running sink task.
pub struct DbSink {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl DbSink {
    /// Connects to the store, preloads the id maps and starts the consumer
    /// task.
    pub async fn connect(cfg: &Config, queue: Arc<BucketQueue>) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&cfg.dbhostname)
            .port(cfg.dbport)
            .username(&cfg.dbuser)
            .password(&cfg.dbpassword)
            .database(&cfg.dbname);

        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| {
                format!("connecting to store {}:{}", cfg.dbhostname, cfg.dbport)
            })?;

        let ids = IdMap::load(&pool, &cfg.stationname, cfg.sensorname.as_deref()).await?;

        let task = tokio::spawn(run(pool, ids, queue));
        Ok(Self { task: Some(task) })
    }

    /// Waits for the consumer task to finish. Close the queue first.
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "sink task join failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    fn idmap(default_sensor: Option<&str>) -> IdMap {
        IdMap::new(
            3,
            vec![
                ("pv".to_string(), 11),
                ("phase1".to_string(), 12),
                ("inverter".to_string(), 13),
            ],
            vec![
                ("voltage".to_string(), 1),
                ("power".to_string(), 2),
                ("urms_phase1".to_string(), 7),
            ],
            default_sensor,
        )
        .expect("valid map")
    }

    #[test]
    fn test_dotted_key_selects_sensor_and_field() {
        let ids = idmap(None);
        assert_eq!(ids.resolve("phase1.voltage").expect("resolves"), (12, 1));
        assert_eq!(ids.resolve("inverter.power").expect("resolves"), (13, 2));
    }

    #[test]
    fn test_dotless_key_uses_configured_sensor() {
        let ids = idmap(Some("pv"));
        assert_eq!(ids.resolve("urms_phase1").expect("resolves"), (11, 7));
    }

    #[test]
    fn test_dotless_key_without_configured_sensor_fails() {
        let ids = idmap(None);
        assert!(matches!(
            ids.resolve("urms_phase1"),
            Err(SinkError::UnknownField(_)),
        ));
    }

    #[test]
    fn test_unknown_sensor_and_field_fail() {
        let ids = idmap(Some("pv"));
        assert!(matches!(
            ids.resolve("battery.voltage"),
            Err(SinkError::UnknownField(_)),
        ));
        assert!(matches!(
            ids.resolve("phase1.reactive"),
            Err(SinkError::UnknownField(_)),
        ));
    }

    #[test]
    fn test_configured_sensor_must_exist() {
        let err = IdMap::new(1, vec![], vec![], Some("pv")).expect_err("missing sensor");
        assert!(err.to_string().contains("pv"));
    }

    #[test]
    fn test_rows_for_emits_one_row_per_field() {
        let ids = idmap(Some("pv"));

        let mut bucket = Bucket::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        bucket.update("phase1.voltage", 230.4);
        bucket.update("inverter.power", 1500.0);
        bucket.update("urms_phase1", 231.0);

        let rows = ids.rows_for(&bucket).expect("resolves");
        assert_eq!(rows.len(), bucket.len());
        assert!(rows.iter().all(|r| r.timekey == 1_700_000_000));
        assert!(rows.contains(&DataRow {
            timekey: 1_700_000_000,
            sensor_id: 12,
            field_id: 1,
            value: 230.4,
        }));
        assert!(rows.contains(&DataRow {
            timekey: 1_700_000_000,
            sensor_id: 11,
            field_id: 7,
            value: 231.0,
        }));
    }

    #[test]
    fn test_rows_for_fails_on_unknown_key() {
        let ids = idmap(None);
        let mut bucket = Bucket::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        bucket.update("phase1.voltage", 230.4);
        bucket.update("phase9.voltage", 230.4);

        assert!(matches!(
            ids.rows_for(&bucket),
            Err(SinkError::UnknownField(_)),
        ));
    }
}
