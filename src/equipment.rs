//! Closed set of greenhouse actuators and their PLC output mapping.
//!
//! Wire identifiers are the Turkish names used by the deployed PLC program
//! and the decision-service prompt; they are fixed by convention and must not
//! be translated.

use std::fmt;

use serde::{de, Deserialize, Deserializer};

/// The eight boolean actuators of the greenhouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EquipmentId {
    Ventilation,
    Shading,
    Heater,
    Humidifier,
    Irrigation,
    Drainage,
    Co2Valve,
    LedLighting,
}

impl EquipmentId {
    pub const ALL: [EquipmentId; 8] = [
        EquipmentId::Ventilation,
        EquipmentId::Shading,
        EquipmentId::Heater,
        EquipmentId::Humidifier,
        EquipmentId::Irrigation,
        EquipmentId::Drainage,
        EquipmentId::Co2Valve,
        EquipmentId::LedLighting,
    ];

    /// Identifier used on the wire (decision service and config file).
    pub fn wire_name(self) -> &'static str {
        match self {
            EquipmentId::Ventilation => "Havalandırma",
            EquipmentId::Shading => "Gölgelendirme",
            EquipmentId::Heater => "Isıtıcı",
            EquipmentId::Humidifier => "Nemlendirici",
            EquipmentId::Irrigation => "Sulama",
            EquipmentId::Drainage => "Drenaj",
            EquipmentId::Co2Valve => "CO2_Tupu",
            EquipmentId::LedLighting => "Led",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.wire_name() == name)
    }

    /// Process-image output driving this actuator (Q0.0 .. Q0.7).
    pub fn output(self) -> OutputBit {
        OutputBit {
            byte: 0,
            bit: self.index() as u8,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            EquipmentId::Ventilation => 0,
            EquipmentId::Shading => 1,
            EquipmentId::Heater => 2,
            EquipmentId::Humidifier => 3,
            EquipmentId::Irrigation => 4,
            EquipmentId::Drainage => 5,
            EquipmentId::Co2Valve => 6,
            EquipmentId::LedLighting => 7,
        }
    }
}

impl fmt::Display for EquipmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl<'de> Deserialize<'de> for EquipmentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        EquipmentId::from_wire_name(&name)
            .ok_or_else(|| de::Error::custom(format!("unknown equipment '{name}'")))
    }
}

/// Address of a discrete output in the process image (e.g. Q0.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputBit {
    pub byte: u16,
    pub bit: u8,
}

impl fmt::Display for OutputBit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q{}.{}", self.byte, self.bit)
    }
}
