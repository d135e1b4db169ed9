//! Canonical battery value domains.
//!
//! Backends translate their native vocabularies into these enums before a
//! value crosses the adapter boundary.  On the wire (inside a
//! [`PropertyValue`][crate::PropertyValue]) each variant travels as the text
//! returned by its `as_str`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::HubError;

/// Charging state of a battery.  Every backend vocabulary collapses into
/// these four values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChargeState {
    Charging,
    Discharging,
    FullyCharged,
    NoCharge,
}

/// Battery cell chemistry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Technology {
    Unknown,
    LithiumIon,
    LithiumPolymer,
    LithiumIronPhosphate,
    LeadAcid,
    NickelCadmium,
    NickelMetalHydride,
}

/// What the battery powers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatteryType {
    Unknown,
    Pda,
    Ups,
    Primary,
    Mouse,
    Keyboard,
    KeyboardMouse,
    Camera,
}

impl ChargeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeState::Charging => "Charging",
            ChargeState::Discharging => "Discharging",
            ChargeState::FullyCharged => "FullyCharged",
            ChargeState::NoCharge => "NoCharge",
        }
    }
}

impl Technology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Technology::Unknown => "Unknown",
            Technology::LithiumIon => "LithiumIon",
            Technology::LithiumPolymer => "LithiumPolymer",
            Technology::LithiumIronPhosphate => "LithiumIronPhosphate",
            Technology::LeadAcid => "LeadAcid",
            Technology::NickelCadmium => "NickelCadmium",
            Technology::NickelMetalHydride => "NickelMetalHydride",
        }
    }

    /// Map the numeric technology code used by power daemons
    /// (0 = unknown, 1 = Li-ion, 2 = Li-poly, 3 = LiFePO4, 4 = lead acid,
    /// 5 = NiCd, 6 = NiMH).  Out-of-range codes are `Unknown`.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Technology::LithiumIon,
            2 => Technology::LithiumPolymer,
            3 => Technology::LithiumIronPhosphate,
            4 => Technology::LeadAcid,
            5 => Technology::NickelCadmium,
            6 => Technology::NickelMetalHydride,
            _ => Technology::Unknown,
        }
    }
}

impl BatteryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatteryType::Unknown => "Unknown",
            BatteryType::Pda => "Pda",
            BatteryType::Ups => "Ups",
            BatteryType::Primary => "Primary",
            BatteryType::Mouse => "Mouse",
            BatteryType::Keyboard => "Keyboard",
            BatteryType::KeyboardMouse => "KeyboardMouse",
            BatteryType::Camera => "Camera",
        }
    }
}

macro_rules! canonical_text {
    ($ty:ty, [$($variant:expr),+ $(,)?]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = HubError;

            /// Parses the canonical text form only; native vocabularies are
            /// the adapters' business.
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                [$($variant),+]
                    .into_iter()
                    .find(|v| v.as_str() == s)
                    .ok_or_else(|| HubError::Unsupported(format!(
                        "'{s}' is not a canonical {} value",
                        stringify!($ty)
                    )))
            }
        }
    };
}

canonical_text!(ChargeState, [
    ChargeState::Charging,
    ChargeState::Discharging,
    ChargeState::FullyCharged,
    ChargeState::NoCharge,
]);

canonical_text!(Technology, [
    Technology::Unknown,
    Technology::LithiumIon,
    Technology::LithiumPolymer,
    Technology::LithiumIronPhosphate,
    Technology::LeadAcid,
    Technology::NickelCadmium,
    Technology::NickelMetalHydride,
]);

canonical_text!(BatteryType, [
    BatteryType::Unknown,
    BatteryType::Pda,
    BatteryType::Ups,
    BatteryType::Primary,
    BatteryType::Mouse,
    BatteryType::Keyboard,
    BatteryType::KeyboardMouse,
    BatteryType::Camera,
]);

/// `round(100 · current / last_full)`, clamped to `0..=100`.
///
/// Returns `None` ("not available") when `last_full` is zero or negative;
/// adapters then leave `chargePercent` unset.
pub fn charge_percent(current: i64, last_full: i64) -> Option<u8> {
    if last_full <= 0 {
        return None;
    }
    let percent = (100.0 * current as f64 / last_full as f64).round();
    Some(percent.clamp(0.0, 100.0) as u8)
}
