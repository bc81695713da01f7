//! Datapoint metadata and the catalog interface
//!
//! The catalog itself is authored elsewhere and shipped as JSON. This module
//! only reads it: [`XcomDataset`] is the in-memory implementation of
//! [`DatapointCatalog`].

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, XcomError};
use crate::types::{ObjectType, PropertyId, XcomFormat, XcomLevel};

fn default_scale() -> f64 {
    1.0
}

/// Catalog limits are numbers, or the marker `"S"` for values that are only
/// known at runtime. Anything that is not a number is treated as absent.
fn number_or_none<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_f64()))
}

/// Metadata of one parameter, info or menu entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datapoint {
    #[serde(rename = "fam")]
    pub family: String,
    #[serde(rename = "lvl")]
    pub level: XcomLevel,
    /// Parent menu nr, 0 for top-level entries
    #[serde(rename = "pnr")]
    pub parent: u16,
    pub nr: u16,
    pub name: String,
    #[serde(rename = "short", default)]
    pub abbr: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(rename = "fmt")]
    pub format: XcomFormat,
    #[serde(rename = "def", default, deserialize_with = "number_or_none")]
    pub default: Option<f64>,
    #[serde(default, deserialize_with = "number_or_none")]
    pub min: Option<f64>,
    #[serde(default, deserialize_with = "number_or_none")]
    pub max: Option<f64>,
    #[serde(default, deserialize_with = "number_or_none")]
    pub inc: Option<f64>,
    /// Enumeration labels keyed by numeric value
    #[serde(rename = "opt", default)]
    pub options: Option<serde_json::Value>,
    /// Wire integer = logical value x scale (integer formats only)
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Fixed wire width for STRING datapoints
    #[serde(default)]
    pub len: Option<usize>,
}

impl Datapoint {
    pub fn new(family: impl Into<String>, nr: u16, level: XcomLevel, format: XcomFormat) -> Self {
        Self {
            family: family.into(),
            level,
            parent: 0,
            nr,
            name: format!("{nr}"),
            abbr: None,
            unit: None,
            format,
            default: None,
            min: None,
            max: None,
            inc: None,
            options: None,
            scale: default_scale(),
            len: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_parent(mut self, parent: u16) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_len(mut self, len: usize) -> Self {
        self.len = Some(len);
        self
    }

    pub fn is_info(&self) -> bool {
        self.level == XcomLevel::Info
    }

    pub fn is_menu(&self) -> bool {
        self.format == XcomFormat::Menu
    }

    pub fn object_type(&self) -> ObjectType {
        if self.is_info() {
            ObjectType::Info
        } else {
            ObjectType::Parameter
        }
    }

    /// Property read to obtain the live value
    ///
    /// Parameters report the RAM value the device is running with, which may
    /// differ from the flash value after a volatile write.
    pub fn value_property(&self) -> PropertyId {
        if self.is_info() {
            PropertyId::Value
        } else {
            PropertyId::UnsavedValue
        }
    }

    /// Property probed to check that the device knows this entry
    pub fn presence_property(&self) -> PropertyId {
        if self.is_info() {
            PropertyId::Value
        } else {
            PropertyId::Level
        }
    }

    /// Label of an enumeration value, if the catalog provides one
    pub fn option_label(&self, value: u32) -> Option<&str> {
        self.options
            .as_ref()?
            .get(value.to_string())
            .and_then(|v| v.as_str())
    }
}

/// Source of datapoint metadata
pub trait DatapointCatalog: Send + Sync {
    /// Look up a datapoint; `family` None matches the first entry with that nr
    fn datapoint(&self, nr: u16, family: Option<&str>) -> Result<Arc<Datapoint>>;

    /// Direct children of menu `parent`, in menu order
    fn menu_items(&self, parent: u16, family: Option<&str>) -> Vec<Arc<Datapoint>>;
}

/// Mains voltage variant of the catalog
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum XcomVoltage {
    #[serde(rename = "120 Vac")]
    Ac120,
    #[default]
    #[serde(rename = "240 Vac")]
    Ac240,
}

/// In-memory catalog loaded from JSON
#[derive(Debug, Clone, Default)]
pub struct XcomDataset {
    datapoints: Vec<Arc<Datapoint>>,
    index: HashMap<(String, u16), usize>,
}

impl XcomDataset {
    pub fn new(datapoints: Vec<Datapoint>) -> Self {
        let mut dataset = Self::default();
        for dp in datapoints {
            dataset.insert(dp);
        }
        dataset
    }

    fn insert(&mut self, dp: Datapoint) {
        let key = (dp.family.clone(), dp.nr);
        match self.index.get(&key) {
            Some(&pos) => self.datapoints[pos] = Arc::new(dp),
            None => {
                self.index.insert(key, self.datapoints.len());
                self.datapoints.push(Arc::new(dp));
            },
        }
    }

    /// Parse the catalog's JSON array, skipping incomplete entries
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(Self::new(parse_entries(text)?))
    }

    /// Replace entries with the same (family, nr) from an override list
    ///
    /// Menu order follows the base list; override entries without a base
    /// counterpart are ignored.
    pub fn with_overrides(mut self, text: &str) -> Result<Self> {
        let mut replaced = 0usize;
        for dp in parse_entries(text)? {
            if let Some(&pos) = self.index.get(&(dp.family.clone(), dp.nr)) {
                self.datapoints[pos] = Arc::new(dp);
                replaced += 1;
            }
        }
        debug!(replaced, "Applied datapoint overrides");
        Ok(self)
    }

    /// Load the base list and, for 120 Vac, merge the override list on top
    pub fn load(
        base: impl AsRef<Path>,
        overrides_120v: Option<&Path>,
        voltage: XcomVoltage,
    ) -> Result<Self> {
        let text = std::fs::read_to_string(base.as_ref())?;
        let mut dataset = Self::from_json(&text)?;

        if voltage == XcomVoltage::Ac120 {
            let path = overrides_120v.ok_or_else(|| {
                XcomError::config("120 Vac dataset requested without override file")
            })?;
            let text = std::fs::read_to_string(path)?;
            dataset = dataset.with_overrides(&text)?;
        }

        info!("Using {} datapoints for {:?}", dataset.len(), voltage);
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.datapoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datapoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Datapoint>> {
        self.datapoints.iter()
    }

    pub fn by_name(&self, name: &str, family: Option<&str>) -> Result<Arc<Datapoint>> {
        self.datapoints
            .iter()
            .find(|dp| dp.name == name && family.is_none_or(|f| dp.family == f))
            .cloned()
            .ok_or_else(|| XcomError::invalid_request(format!("unknown datapoint name '{name}'")))
    }
}

impl DatapointCatalog for XcomDataset {
    fn datapoint(&self, nr: u16, family: Option<&str>) -> Result<Arc<Datapoint>> {
        let found = match family {
            Some(f) => self
                .index
                .get(&(f.to_string(), nr))
                .map(|&pos| self.datapoints[pos].clone()),
            None => self.datapoints.iter().find(|dp| dp.nr == nr).cloned(),
        };
        found.ok_or_else(|| XcomError::UnknownDatapoint {
            nr,
            family: family.map(str::to_string),
        })
    }

    fn menu_items(&self, parent: u16, family: Option<&str>) -> Vec<Arc<Datapoint>> {
        self.datapoints
            .iter()
            .filter(|dp| dp.parent == parent && family.is_none_or(|f| dp.family == f))
            .cloned()
            .collect()
    }
}

fn parse_entries(text: &str) -> Result<Vec<Datapoint>> {
    let raw: Vec<serde_json::Value> = serde_json::from_str(text)?;
    let total = raw.len();

    let entries: Vec<Datapoint> = raw
        .into_iter()
        .filter_map(|v| match serde_json::from_value::<Datapoint>(v) {
            Ok(dp) if !dp.name.trim().is_empty() && dp.nr != 0 => Some(dp),
            Ok(_) => None,
            Err(e) => {
                debug!("Skipping catalog entry: {}", e);
                None
            },
        })
        .map(|mut dp| {
            dp.name = dp.name.trim().to_string();
            dp
        })
        .collect();

    if entries.len() < total {
        debug!(skipped = total - entries.len(), "Incomplete catalog entries");
    }
    Ok(entries)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    const BASE: &str = r#"[
        {"fam": "xt", "lvl": "INFO", "pnr": 0, "nr": 3000, "name": "Battery voltage",
         "short": "Ubat", "unit": "Vdc", "fmt": "FLOAT", "def": null, "min": null, "max": null},
        {"fam": "xt", "lvl": "BASIC", "pnr": 0, "nr": 1100, "name": "Basic settings",
         "fmt": "MENU"},
        {"fam": "xt", "lvl": "BASIC", "pnr": 1100, "nr": 1107, "name": "Maximum current of AC source",
         "short": "Iin", "unit": "Aac", "fmt": "FLOAT", "def": 32, "min": 2, "max": 50, "inc": 1},
        {"fam": "xt", "lvl": "EXPERT", "pnr": 1100, "nr": 1552, "name": "Type of detection",
         "fmt": "LONG ENUM", "def": 1, "opt": {"1": "Slow", "2": "Tolerant", "4": "Fast"}},
        {"fam": "bsp", "lvl": "INFO", "pnr": 0, "nr": 7000, "name": "Battery voltage",
         "fmt": "FLOAT"},
        {"fam": "xt", "lvl": "INFO", "pnr": 0, "nr": 3001, "fmt": "FLOAT"},
        {"fam": "xt", "lvl": "INFO", "pnr": "x", "nr": 3002, "name": "Bad parent", "fmt": "FLOAT"}
    ]"#;

    const OVERRIDE_120V: &str = r#"[
        {"fam": "xt", "lvl": "BASIC", "pnr": 1100, "nr": 1107, "name": "Maximum current of AC source",
         "fmt": "FLOAT", "def": 16, "min": 1, "max": 50},
        {"fam": "xt", "lvl": "BASIC", "pnr": 1100, "nr": 1999, "name": "Not in base", "fmt": "FLOAT"}
    ]"#;

    #[test]
    fn test_incomplete_entries_skipped() {
        let dataset = XcomDataset::from_json(BASE).unwrap();
        assert_eq!(dataset.len(), 5);
        assert!(dataset.datapoint(3001, None).is_err());
        assert!(dataset.datapoint(3002, None).is_err());
    }

    #[test]
    fn test_lookup_by_nr_and_family() {
        let dataset = XcomDataset::from_json(BASE).unwrap();

        let dp = dataset.datapoint(1107, None).unwrap();
        assert_eq!(dp.family, "xt");
        assert_eq!(dp.format, XcomFormat::Float);
        assert_eq!(dp.object_type(), ObjectType::Parameter);
        assert_eq!(dp.value_property(), PropertyId::UnsavedValue);
        assert_eq!(dp.default, Some(32.0));

        let dp = dataset.datapoint(3000, Some("xt")).unwrap();
        assert_eq!(dp.object_type(), ObjectType::Info);
        assert_eq!(dp.value_property(), PropertyId::Value);
        assert_eq!(dp.abbr.as_deref(), Some("Ubat"));

        let err = dataset.datapoint(3000, Some("bsp")).unwrap_err();
        assert!(matches!(err, XcomError::UnknownDatapoint { nr: 3000, .. }));
        assert!(dataset.datapoint(9999, None).is_err());
    }

    #[test]
    fn test_menu_items_in_order() {
        let dataset = XcomDataset::from_json(BASE).unwrap();

        let root: Vec<u16> = dataset.menu_items(0, Some("xt")).iter().map(|d| d.nr).collect();
        assert_eq!(root, vec![3000, 1100]);

        let sub: Vec<u16> = dataset.menu_items(1100, None).iter().map(|d| d.nr).collect();
        assert_eq!(sub, vec![1107, 1552]);
    }

    #[test]
    fn test_overrides_keep_order() {
        let dataset = XcomDataset::from_json(BASE)
            .unwrap()
            .with_overrides(OVERRIDE_120V)
            .unwrap();

        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.datapoint(1107, Some("xt")).unwrap().default, Some(16.0));
        assert!(dataset.datapoint(1999, None).is_err());

        let sub: Vec<u16> = dataset.menu_items(1100, None).iter().map(|d| d.nr).collect();
        assert_eq!(sub, vec![1107, 1552]);
    }

    #[test]
    fn test_option_labels_and_name_lookup() {
        let dataset = XcomDataset::from_json(BASE).unwrap();
        let dp = dataset.datapoint(1552, None).unwrap();
        assert_eq!(dp.option_label(2), Some("Tolerant"));
        assert_eq!(dp.option_label(3), None);

        let dp = dataset.by_name("Battery voltage", Some("bsp")).unwrap();
        assert_eq!(dp.nr, 7000);
        assert!(dataset.by_name("Nope", None).is_err());
    }

    #[test]
    fn test_load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("datapoints_240v.json");
        let over = dir.path().join("datapoints_120v.json");
        std::fs::write(&base, BASE).unwrap();
        std::fs::write(&over, OVERRIDE_120V).unwrap();

        let ds = XcomDataset::load(&base, Some(&over), XcomVoltage::Ac240).unwrap();
        assert_eq!(ds.datapoint(1107, None).unwrap().default, Some(32.0));

        let ds = XcomDataset::load(&base, Some(&over), XcomVoltage::Ac120).unwrap();
        assert_eq!(ds.datapoint(1107, None).unwrap().default, Some(16.0));

        assert!(XcomDataset::load(&base, None, XcomVoltage::Ac120).is_err());
    }

    #[test]
    fn test_builder() {
        let dp = Datapoint::new("xt", 1138, XcomLevel::Basic, XcomFormat::Format)
            .with_scale(10.0)
            .with_parent(1100)
            .with_name("Battery charge current");
        assert_eq!(dp.scale, 10.0);
        assert_eq!(dp.parent, 1100);
        assert_eq!(dp.presence_property(), PropertyId::Level);
    }
}
