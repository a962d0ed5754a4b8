use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::warn;

/// Which driver family the daemon runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterType {
    Solivia,
    Ale3,
    Modbus,
}

impl MeterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Solivia => "solivia",
            Self::Ale3 => "ale3",
            Self::Modbus => "modbus",
        }
    }
}

impl FromStr for MeterType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "solivia" => Ok(Self::Solivia),
            "ale3" => Ok(Self::Ale3),
            "modbus" => Ok(Self::Modbus),
            other => bail!("unknown meter type: {other}"),
        }
    }
}

/// Raw `key = value` settings: built-in defaults, overlaid by the
/// configuration file, overlaid by command-line options.
#[derive(Debug, Clone, Default)]
pub struct ConfigMap {
    entries: BTreeMap<String, String>,
}

impl ConfigMap {
    /// The daemon's built-in defaults.
    pub fn builtin() -> Self {
        let mut map = Self::default();
        map.set("dbhostname", "localhost");
        map.set("dbport", "3307");
        map.set("meterhostname", "localhost");
        map.set("meterid", "1");
        map.set("meterinterval", "2.0");
        map
    }

    /// Overlays the line-oriented configuration file: one `key = value` per
    /// line, `#` starts a comment, surrounding whitespace is trimmed.
    pub fn merge_file(&mut self, text: &str) {
        for raw in text.lines() {
            let line = match raw.find('#') {
                Some(i) => &raw[..i],
                None => raw,
            };
            if line.trim().is_empty() {
                continue;
            }

            match line.split_once('=') {
                Some((key, value)) => self.set(key.trim(), value.trim()),
                None => warn!(line = line.trim(), "ignoring malformed config line"),
            }
        }
    }

    /// Reads and overlays a configuration file from disk.
    pub fn merge_path(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        self.merge_file(&text);
        Ok(())
    }

    pub fn set(&mut self, key: &str, value: impl ToString) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn string(&self, key: &str) -> String {
        self.get(key).unwrap_or_default().to_string()
    }

    fn optional(&self, key: &str) -> Option<String> {
        self.get(key).map(str::to_string)
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse()
                .map(Some)
                .with_context(|| format!("invalid value for {key}: '{raw}'")),
        }
    }

    fn bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => {
                parse_bool(raw).with_context(|| format!("invalid value for {key}: '{raw}'"))
            }
        }
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        other => bail!("not a boolean: {other}"),
    }
}

/// Validated daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub dbhostname: String,
    pub dbport: u16,
    pub dbname: String,
    pub dbuser: String,
    pub dbpassword: String,

    /// Station row selecting this installation in the store. Required.
    pub stationname: String,
    /// Sensor for dotless field names (single-sensor deployments).
    pub sensorname: Option<String>,

    pub metertype: MeterType,
    pub meterhostname: String,
    /// Device port; the driver falls back to its family default.
    pub meterport: Option<u16>,
    pub meterid: u8,
    /// Upper bound on the per-tick polling interval.
    pub meterinterval: Duration,

    /// UDP bind port for the Solivia driver.
    pub listenport: Option<u16>,
    /// If set, the Solivia driver never transmits.
    pub meterpassive: bool,

    /// Field-description file for the generic Modbus driver.
    pub datafields: Option<PathBuf>,

    /// Read registers from the waveform simulator instead of a device.
    pub simulate: bool,
}

impl Config {
    /// Extracts and validates the typed configuration. Missing required
    /// keys and unparseable values fail here, before anything starts.
    pub fn from_map(map: &ConfigMap) -> Result<Self> {
        let stationname = map.string("stationname");
        if stationname.is_empty() {
            bail!("stationname is required");
        }

        let metertype: MeterType = map
            .get("metertype")
            .context("metertype is required")?
            .parse()?;

        let interval_secs: f64 = map.parse("meterinterval")?.unwrap_or(2.0);
        if !interval_secs.is_finite() || interval_secs <= 0.0 {
            bail!("meterinterval must be positive");
        }

        let cfg = Self {
            dbhostname: map.string("dbhostname"),
            dbport: map.parse("dbport")?.unwrap_or(3307),
            dbname: map.string("dbname"),
            dbuser: map.string("dbuser"),
            dbpassword: map.string("dbpassword"),
            stationname,
            sensorname: map.optional("sensorname"),
            metertype,
            meterhostname: map.string("meterhostname"),
            meterport: map.parse("meterport")?,
            meterid: map.parse("meterid")?.unwrap_or(1),
            meterinterval: Duration::from_secs_f64(interval_secs),
            listenport: map.parse("listenport")?,
            meterpassive: map.bool("meterpassive", false)?,
            datafields: map.optional("datafields").map(PathBuf::from),
            simulate: map.bool("simulate", false)?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        match self.metertype {
            MeterType::Ale3 => {
                // ALE3 field names carry no sensor prefix; the sink needs
                // the configured sensor to resolve them.
                if self.sensorname.is_none() {
                    bail!("sensorname is required for metertype ale3");
                }
            }
            MeterType::Solivia => {
                if self.listenport.is_none() {
                    bail!("listenport is required for metertype solivia");
                }
            }
            MeterType::Modbus => {
                if self.datafields.is_none() {
                    bail!("datafields is required for metertype modbus");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ale3_map() -> ConfigMap {
        let mut map = ConfigMap::builtin();
        map.set("stationname", "alp");
        map.set("sensorname", "power");
        map.set("metertype", "ale3");
        map
    }

    #[test]
    fn test_builtin_defaults() {
        let cfg = Config::from_map(&ale3_map()).expect("valid");
        assert_eq!(cfg.dbhostname, "localhost");
        assert_eq!(cfg.dbport, 3307);
        assert_eq!(cfg.meterhostname, "localhost");
        assert_eq!(cfg.meterid, 1);
        assert_eq!(cfg.meterinterval, Duration::from_secs(2));
        assert!(!cfg.meterpassive);
        assert!(!cfg.simulate);
        assert_eq!(cfg.meterport, None);
    }

    #[test]
    fn test_file_overlays_defaults() {
        let mut map = ale3_map();
        map.merge_file(
            "# power meter at the barn\n\
             dbhostname = db.example.org   # override\n\
             dbport=3306\n\
             \n\
             meterinterval = 0.5\n",
        );

        let cfg = Config::from_map(&map).expect("valid");
        assert_eq!(cfg.dbhostname, "db.example.org");
        assert_eq!(cfg.dbport, 3306);
        assert_eq!(cfg.meterinterval, Duration::from_millis(500));
    }

    #[test]
    fn test_whitespace_trimmed_around_key_and_value() {
        let mut map = ale3_map();
        map.merge_file("   dbuser   =   meter   \n");
        assert_eq!(Config::from_map(&map).expect("valid").dbuser, "meter");
    }

    #[test]
    fn test_comment_only_and_malformed_lines_ignored() {
        let mut map = ale3_map();
        map.merge_file("# full line comment\nthis line has no equals sign\n");
        assert!(Config::from_map(&map).is_ok());
    }

    #[test]
    fn test_later_settings_win() {
        let mut map = ale3_map();
        map.merge_file("dbname = first\ndbname = second\n");
        assert_eq!(Config::from_map(&map).expect("valid").dbname, "second");

        // Command-line style override on top.
        map.set("dbname", "cli");
        assert_eq!(Config::from_map(&map).expect("valid").dbname, "cli");
    }

    #[test]
    fn test_stationname_required() {
        let mut map = ConfigMap::builtin();
        map.set("metertype", "ale3");
        let err = Config::from_map(&map).expect_err("missing stationname");
        assert!(err.to_string().contains("stationname"));
    }

    #[test]
    fn test_metertype_required() {
        let mut map = ConfigMap::builtin();
        map.set("stationname", "alp");
        let err = Config::from_map(&map).expect_err("missing metertype");
        assert!(err.to_string().contains("metertype"));
    }

    #[test]
    fn test_unknown_metertype_rejected() {
        let mut map = ale3_map();
        map.set("metertype", "fronius");
        let err = Config::from_map(&map).expect_err("unknown type");
        assert!(err.to_string().contains("fronius"));
    }

    #[test]
    fn test_solivia_requires_listenport() {
        let mut map = ConfigMap::builtin();
        map.set("stationname", "alp");
        map.set("metertype", "solivia");
        let err = Config::from_map(&map).expect_err("missing listenport");
        assert!(err.to_string().contains("listenport"));

        map.set("listenport", "6999");
        let cfg = Config::from_map(&map).expect("valid");
        assert_eq!(cfg.listenport, Some(6999));
    }

    #[test]
    fn test_modbus_requires_datafields() {
        let mut map = ConfigMap::builtin();
        map.set("stationname", "alp");
        map.set("metertype", "modbus");
        assert!(Config::from_map(&map).is_err());

        map.set("datafields", "/etc/powermeter/fields.csv");
        let cfg = Config::from_map(&map).expect("valid");
        assert_eq!(
            cfg.datafields.as_deref(),
            Some(Path::new("/etc/powermeter/fields.csv")),
        );
    }

    #[test]
    fn test_bool_values() {
        let mut map = ConfigMap::builtin();
        map.set("stationname", "alp");
        map.set("metertype", "solivia");
        map.set("listenport", "6999");
        map.set("meterpassive", "yes");
        assert!(Config::from_map(&map).expect("valid").meterpassive);

        map.set("meterpassive", "0");
        assert!(!Config::from_map(&map).expect("valid").meterpassive);

        map.set("meterpassive", "maybe");
        assert!(Config::from_map(&map).is_err());
    }

    #[test]
    fn test_nonpositive_interval_rejected() {
        let mut map = ale3_map();
        map.set("meterinterval", "0");
        assert!(Config::from_map(&map).is_err());
    }
}
