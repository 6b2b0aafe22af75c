//! Band identification from advertisement data.
//!
//! No single advertisement field identifies the band across models and
//! firmware revisions, so [`classify`] layers independent heuristics and takes
//! the first that matches:
//!
//! 1. The peripheral is the previously bonded device.
//! 2. It advertises a vendor-family GATT service.
//! 3. Its manufacturer data starts with a vendor company identifier.
//! 4. Its name contains a band-family token.
//! 5. It advertises both Heart Rate and Battery services and its signal is
//!    above the RSSI floor.
//!
//! Signal strength only filters rule 5; it never makes a match on its own.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ble::advertising::{DiscoveredPeripheral, PeripheralId};
use crate::ble::uuids::{
    BATTERY_SERVICE_UUID, HEART_RATE_SERVICE_UUID, VENDOR_COMPANY_IDS, VENDOR_SERVICE_UUIDS,
};

/// Why a peripheral was accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MatchReason {
    /// Same id as the device recorded at the last successful sync.
    PreviouslyBonded,
    /// Advertises a vendor-family service.
    VendorService(Uuid),
    /// Manufacturer data carries a vendor company identifier.
    ManufacturerCode(u16),
    /// Advertised name contains a band-family token.
    NameToken(String),
    /// Advertises Heart Rate and Battery services with a strong enough signal.
    HeartRateBatteryCombination,
}

impl MatchReason {
    /// Short description for diagnostics.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::PreviouslyBonded => "previously bonded device",
            Self::VendorService(_) => "vendor service UUID",
            Self::ManufacturerCode(_) => "manufacturer code",
            Self::NameToken(_) => "name token",
            Self::HeartRateBatteryCombination => "heart-rate+battery combination",
        }
    }
}

impl std::fmt::Display for MatchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VendorService(uuid) => write!(f, "{} ({})", self.describe(), uuid),
            Self::ManufacturerCode(id) => write!(f, "{} ({:#06x})", self.describe(), id),
            Self::NameToken(token) => write!(f, "{} ({:?})", self.describe(), token),
            _ => f.write_str(self.describe()),
        }
    }
}

/// A scanned peripheral with the classifier's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedCandidate {
    /// The advertisement that was classified.
    pub peripheral: DiscoveredPeripheral,
    /// Whether the peripheral is accepted as the band.
    pub is_match: bool,
    /// Reasons for the verdict, in rule order. Empty when rejected.
    pub reasons: Vec<MatchReason>,
}

impl ClassifiedCandidate {
    /// The reason that decided the match.
    pub fn primary_reason(&self) -> Option<&MatchReason> {
        self.reasons.first()
    }
}

/// Tunable inputs of the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Services that identify the vendor family.
    pub vendor_services: Vec<Uuid>,
    /// Company identifiers that identify the vendor family.
    pub company_ids: Vec<u16>,
    /// Lowercase tokens searched for in the advertised name.
    pub name_tokens: Vec<String>,
    /// Signal floor in dBm for the heart-rate+battery heuristic.
    pub rssi_floor: i16,
}

impl ClassifierConfig {
    /// Default RSSI floor in dBm.
    pub const DEFAULT_RSSI_FLOOR: i16 = -80;

    /// Override the RSSI floor.
    pub fn with_rssi_floor(mut self, rssi_floor: i16) -> Self {
        self.rssi_floor = rssi_floor;
        self
    }

    /// Add a name token (stored lowercase).
    pub fn with_name_token(mut self, token: &str) -> Self {
        self.name_tokens.push(token.to_lowercase());
        self
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            vendor_services: VENDOR_SERVICE_UUIDS.to_vec(),
            company_ids: VENDOR_COMPANY_IDS.to_vec(),
            name_tokens: ["mi band", "smart band", "amazfit", "band", "fitness", "tracker"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
            rssi_floor: Self::DEFAULT_RSSI_FLOOR,
        }
    }
}

/// Classify a peripheral.
///
/// Pure: the same inputs always give the same verdict and reasons.
pub fn classify(
    peripheral: &DiscoveredPeripheral,
    prior_known_device: Option<&PeripheralId>,
    config: &ClassifierConfig,
) -> ClassifiedCandidate {
    let reason = match_reason(peripheral, prior_known_device, config);

    ClassifiedCandidate {
        peripheral: peripheral.clone(),
        is_match: reason.is_some(),
        reasons: reason.into_iter().collect(),
    }
}

fn match_reason(
    peripheral: &DiscoveredPeripheral,
    prior_known_device: Option<&PeripheralId>,
    config: &ClassifierConfig,
) -> Option<MatchReason> {
    if prior_known_device == Some(&peripheral.id) {
        return Some(MatchReason::PreviouslyBonded);
    }

    if let Some(uuid) = config
        .vendor_services
        .iter()
        .find(|uuid| peripheral.advertises(uuid))
    {
        return Some(MatchReason::VendorService(*uuid));
    }

    if let Some(company_id) = peripheral
        .company_id()
        .filter(|id| config.company_ids.contains(id))
    {
        return Some(MatchReason::ManufacturerCode(company_id));
    }

    if let Some(name) = peripheral.name.as_deref() {
        let name = name.to_lowercase();
        if let Some(token) = config
            .name_tokens
            .iter()
            .find(|token| !token.is_empty() && name.contains(token.as_str()))
        {
            return Some(MatchReason::NameToken(token.clone()));
        }
    }

    let strong_enough = peripheral
        .rssi
        .map(|rssi| rssi > config.rssi_floor)
        .unwrap_or(false);
    if strong_enough
        && peripheral.advertises(&HEART_RATE_SERVICE_UUID)
        && peripheral.advertises(&BATTERY_SERVICE_UUID)
    {
        return Some(MatchReason::HeartRateBatteryCombination);
    }

    None
}
