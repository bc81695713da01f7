//! Device families and address resolution
//!
//! Several device families share one Xcom bus. Each owns a contiguous block of
//! wire addresses; instances are numbered from 1 within the family.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::{Result, XcomError};
use crate::types::AggregationType;

/// A device category and its slice of the address space
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFamily {
    /// Lower-case id, e.g. `xt`
    pub id: String,
    /// Family whose datapoint numbers this family uses (`l1` uses `xt`)
    #[serde(default)]
    pub id_for_nr: Option<String>,
    #[serde(default)]
    pub model: String,
    /// Write-only address reaching every device of the family
    pub addr_multicast: u16,
    pub addr_devices_start: u16,
    pub addr_devices_end: u16,
    #[serde(default)]
    pub nr_params_start: u16,
    #[serde(default)]
    pub nr_params_end: u16,
    #[serde(default)]
    pub nr_infos_start: u16,
    #[serde(default)]
    pub nr_infos_end: u16,
    /// Info or param probed to detect whether a device is present
    #[serde(default)]
    pub nr_discover: u16,
}

impl DeviceFamily {
    #[allow(clippy::too_many_arguments)]
    fn standard(
        id: &str,
        id_for_nr: &str,
        model: &str,
        addr_multicast: u16,
        addr_devices: (u16, u16),
        nr_params: (u16, u16),
        nr_infos: (u16, u16),
        nr_discover: u16,
    ) -> Self {
        Self {
            id: id.to_string(),
            id_for_nr: Some(id_for_nr.to_string()),
            model: model.to_string(),
            addr_multicast,
            addr_devices_start: addr_devices.0,
            addr_devices_end: addr_devices.1,
            nr_params_start: nr_params.0,
            nr_params_end: nr_params.1,
            nr_infos_start: nr_infos.0,
            nr_infos_end: nr_infos.1,
            nr_discover,
        }
    }

    /// Family id used by the catalog for this family's datapoints
    pub fn nr_family(&self) -> &str {
        self.id_for_nr.as_deref().unwrap_or(&self.id)
    }

    /// Number of addressable instances
    pub fn device_count(&self) -> u16 {
        self.addr_devices_end
            .saturating_sub(self.addr_devices_start)
            .saturating_add(1)
    }

    pub fn is_single_instance(&self) -> bool {
        self.addr_devices_start == self.addr_devices_end
    }

    pub fn contains_device_address(&self, addr: u16) -> bool {
        (self.addr_devices_start..=self.addr_devices_end).contains(&addr)
    }

    /// Whether datapoints of catalog family `family` can be sent to this family
    pub fn accepts_datapoint_family(&self, family: &str) -> bool {
        self.nr_family() == family
    }

    /// Device code of the `index`-th instance (`XT3`, `BSP`)
    pub fn code(&self, index: u16) -> String {
        if self.is_single_instance() {
            self.id.to_uppercase()
        } else {
            format!("{}{}", self.id.to_uppercase(), index)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(XcomError::config("device family with empty id"));
        }
        if self.addr_devices_start == 0 || self.addr_devices_start > self.addr_devices_end {
            return Err(XcomError::config(format!(
                "family '{}': invalid device range {}-{}",
                self.id, self.addr_devices_start, self.addr_devices_end
            )));
        }
        Ok(())
    }

    /// Every address this family answers to
    fn claimed_addresses(&self) -> impl Iterator<Item = u16> + '_ {
        std::iter::once(self.addr_multicast)
            .chain(self.addr_devices_start..=self.addr_devices_end)
    }
}

/// Which battery family sits at address 601
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryKind {
    #[default]
    Bsp,
    Bms,
}

/// The standard Studer family table
///
/// BSP and BMS occupy the same addresses; `battery` picks which one is present.
pub fn standard_families(battery: BatteryKind) -> Vec<DeviceFamily> {
    let battery_family = match battery {
        BatteryKind::Bsp => DeviceFamily::standard(
            "bsp",
            "bsp",
            "BSP",
            600,
            (601, 601),
            (6000, 6999),
            (7000, 7999),
            7036,
        ),
        BatteryKind::Bms => DeviceFamily::standard(
            "bms",
            "bms",
            "Xcom-CAN BMS",
            600,
            (601, 601),
            (6000, 6999),
            (7000, 7999),
            7054,
        ),
    };

    vec![
        DeviceFamily::standard(
            "xt",
            "xt",
            "Xtender",
            100,
            (101, 109),
            (1000, 1999),
            (3000, 3999),
            3000,
        ),
        DeviceFamily::standard(
            "l1",
            "xt",
            "Phase L1",
            191,
            (191, 191),
            (1000, 1999),
            (3000, 3999),
            3000,
        ),
        DeviceFamily::standard(
            "l2",
            "xt",
            "Phase L2",
            192,
            (192, 192),
            (1000, 1999),
            (3000, 3999),
            3000,
        ),
        DeviceFamily::standard(
            "l3",
            "xt",
            "Phase L3",
            193,
            (193, 193),
            (1000, 1999),
            (3000, 3999),
            3000,
        ),
        DeviceFamily::standard("rcc", "rcc", "RCC", 500, (501, 501), (5000, 5999), (0, 0), 5002),
        battery_family,
        DeviceFamily::standard(
            "vt",
            "vt",
            "VarioTrack",
            300,
            (301, 315),
            (10000, 10999),
            (11000, 11999),
            11000,
        ),
        DeviceFamily::standard(
            "vs",
            "vs",
            "VarioString",
            700,
            (701, 715),
            (14000, 14999),
            (15000, 15999),
            15000,
        ),
    ]
}

/// A (family, 1-based index) pair naming one physical device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInstance {
    pub family: String,
    pub index: u16,
}

impl DeviceInstance {
    pub fn new(family: impl Into<String>, index: u16) -> Self {
        Self {
            family: family.into(),
            index,
        }
    }
}

impl fmt::Display for DeviceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.family, self.index)
    }
}

/// Immutable set of families configured on one link
#[derive(Debug, Clone, PartialEq)]
pub struct AddressBook {
    families: Vec<DeviceFamily>,
}

impl AddressBook {
    /// Build an address book, rejecting duplicate ids and overlapping addresses
    pub fn new(families: Vec<DeviceFamily>) -> Result<Self> {
        let mut ids = HashSet::new();
        for family in &families {
            family.validate()?;
            if !ids.insert(family.id.as_str()) {
                return Err(XcomError::config(format!(
                    "duplicate device family '{}'",
                    family.id
                )));
            }
        }

        for (i, a) in families.iter().enumerate() {
            let claimed: HashSet<u16> = a.claimed_addresses().collect();
            for b in &families[i + 1..] {
                if let Some(addr) = b.claimed_addresses().find(|addr| claimed.contains(addr)) {
                    return Err(XcomError::config(format!(
                        "device families '{}' and '{}' both claim address {}",
                        a.id, b.id, addr
                    )));
                }
            }
        }

        Ok(Self { families })
    }

    /// Standard table with the given battery family
    pub fn standard(battery: BatteryKind) -> Self {
        Self {
            families: standard_families(battery),
        }
    }

    pub fn families(&self) -> &[DeviceFamily] {
        &self.families
    }

    pub fn family(&self, id: &str) -> Result<&DeviceFamily> {
        self.families
            .iter()
            .find(|f| f.id.eq_ignore_ascii_case(id))
            .ok_or_else(|| XcomError::UnknownFamily(id.to_string()))
    }

    /// Wire address of instance `index` of `family`
    pub fn to_wire_address(&self, family: &str, index: u16) -> Result<u16> {
        let fam = self.family(family)?;
        let count = fam.device_count();
        if index == 0 || index > count {
            return Err(XcomError::AddressOutOfRange {
                family: fam.id.clone(),
                index,
                count,
            });
        }
        Ok(fam.addr_devices_start + (index - 1))
    }

    /// Family and instance index owning a device address
    ///
    /// A family's multicast address resolves to index 0.
    pub fn from_wire_address(&self, addr: u16) -> Result<(&DeviceFamily, u16)> {
        if let Some(fam) = self.families.iter().find(|f| f.contains_device_address(addr)) {
            return Ok((fam, addr - fam.addr_devices_start + 1));
        }
        self.families
            .iter()
            .find(|f| f.addr_multicast == addr)
            .map(|fam| (fam, 0))
            .ok_or(XcomError::UnknownAddress(addr))
    }

    pub fn resolve(&self, instance: &DeviceInstance) -> Result<u16> {
        self.to_wire_address(&instance.family, instance.index)
    }

    pub fn instance_for_address(&self, addr: u16) -> Result<DeviceInstance> {
        let (fam, index) = self.from_wire_address(addr)?;
        Ok(DeviceInstance::new(fam.id.clone(), index))
    }

    /// Device code of an address (`XT1`, `VT12`, `RCC`); multicast yields the bare id
    pub fn code_for_address(&self, addr: u16) -> Result<String> {
        let (fam, index) = self.from_wire_address(addr)?;
        Ok(if index == 0 {
            fam.id.to_uppercase()
        } else {
            fam.code(index)
        })
    }

    /// Parse a device code into an instance
    pub fn parse_code(&self, code: &str) -> Result<DeviceInstance> {
        let upper = code.trim().to_uppercase();

        for fam in &self.families {
            let id = fam.id.to_uppercase();
            if fam.is_single_instance() {
                if upper == id {
                    return Ok(DeviceInstance::new(fam.id.clone(), 1));
                }
                continue;
            }

            let Some(digits) = upper.strip_prefix(id.as_str()) else {
                continue;
            };
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            let index: u16 = digits
                .parse()
                .map_err(|_| XcomError::UnknownFamily(code.to_string()))?;
            let count = fam.device_count();
            if index == 0 || index > count {
                return Err(XcomError::AddressOutOfRange {
                    family: fam.id.clone(),
                    index,
                    count,
                });
            }
            return Ok(DeviceInstance::new(fam.id.clone(), index));
        }

        Err(XcomError::UnknownFamily(code.to_string()))
    }

    /// Resolve a device code straight to its wire address
    pub fn address_for_code(&self, code: &str) -> Result<u16> {
        let instance = self.parse_code(code)?;
        self.resolve(&instance)
    }

    // ========================================================================
    // Multi-info aggregation
    // ========================================================================

    /// Family and aggregation type a device code selects
    ///
    /// `XT3` selects device 3 of `xt`. The bare id of a multi-instance family
    /// (`XT`, `VT`) selects the master; single-instance codes select device 1.
    pub fn aggregation_target(&self, code: &str) -> Result<(&DeviceFamily, AggregationType)> {
        let trimmed = code.trim();
        if let Some(fam) = self
            .families
            .iter()
            .find(|f| !f.is_single_instance() && f.id.eq_ignore_ascii_case(trimmed))
        {
            return Ok((fam, AggregationType::Master));
        }

        let instance = self.parse_code(trimmed)?;
        let fam = self.family(&instance.family)?;
        Ok((fam, device_aggregation(instance.index)?))
    }

    pub fn aggregation_for_code(&self, code: &str) -> Result<AggregationType> {
        self.aggregation_target(code).map(|(_, aggregation)| aggregation)
    }

    /// Aggregation type of a device address; multicast addresses have none
    pub fn aggregation_for_address(&self, addr: u16) -> Result<AggregationType> {
        match self.from_wire_address(addr)? {
            (_, 0) => Err(XcomError::UnknownAddress(addr)),
            (_, index) => device_aggregation(index),
        }
    }

    /// Device code an aggregation type stands for within `family`
    pub fn code_for_aggregation(&self, family: &str, aggregation: AggregationType) -> Result<String> {
        let fam = self.family(family)?;
        match aggregation {
            AggregationType::Master => Ok(fam.id.to_uppercase()),
            AggregationType::Device(index) => {
                let index = u16::from(index);
                self.to_wire_address(&fam.id, index)?;
                Ok(fam.code(index))
            },
            other => Err(XcomError::invalid_request(format!(
                "{other:?} aggregation names no single device"
            ))),
        }
    }
}

fn device_aggregation(index: u16) -> Result<AggregationType> {
    match u8::try_from(index) {
        Ok(idx @ 1..=15) => Ok(AggregationType::Device(idx)),
        _ => Err(XcomError::invalid_request(format!(
            "device index {index} has no aggregation type"
        ))),
    }
}
