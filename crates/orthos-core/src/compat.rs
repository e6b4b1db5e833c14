//! Architecture / system class compatibility
//!
//! The single authority deciding which virtualization or system class a
//! machine of a given CPU architecture may be configured as. Every machine
//! registration, system change and provisioning request goes through
//! [`is_compatible`] before anything is written or queued.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// CPU architecture of a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "s390x")]
    S390x,
    #[serde(rename = "ppc64")]
    Ppc64,
    #[serde(rename = "ppc64le")]
    Ppc64le,
    #[serde(rename = "aarch64")]
    Aarch64,
    #[serde(rename = "embedded")]
    Embedded,
}

impl Architecture {
    pub const ALL: [Architecture; 6] = [
        Architecture::X86_64,
        Architecture::S390x,
        Architecture::Ppc64,
        Architecture::Ppc64le,
        Architecture::Aarch64,
        Architecture::Embedded,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::S390x => "s390x",
            Architecture::Ppc64 => "ppc64",
            Architecture::Ppc64le => "ppc64le",
            Architecture::Aarch64 => "aarch64",
            Architecture::Embedded => "embedded",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Architecture::ALL
            .into_iter()
            .find(|arch| arch.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CoreError::validation(format!("unknown architecture: {s}")))
    }
}

/// System or virtualization class a machine runs as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SystemClass {
    #[serde(rename = "BareMetal")]
    BareMetal,
    #[serde(rename = "KVM")]
    Kvm,
    #[serde(rename = "XEN")]
    Xen,
    #[serde(rename = "HMC")]
    Hmc,
    #[serde(rename = "zVM")]
    ZVm,
    #[serde(rename = "zKVM")]
    ZKvm,
    #[serde(rename = "LPAR zSeries")]
    LparZSeries,
    #[serde(rename = "LPAR PowerPC")]
    LparPowerPc,
    #[serde(rename = "PowerVM")]
    PowerVm,
    #[serde(rename = "Storage Array")]
    StorageArray,
    #[serde(rename = "FC Switch")]
    FcSwitch,
    #[serde(rename = "Network Switch")]
    NetworkSwitch,
    #[serde(rename = "Omni-Path Switch")]
    OmniPathSwitch,
}

impl SystemClass {
    pub const ALL: [SystemClass; 13] = [
        SystemClass::BareMetal,
        SystemClass::Kvm,
        SystemClass::Xen,
        SystemClass::Hmc,
        SystemClass::ZVm,
        SystemClass::ZKvm,
        SystemClass::LparZSeries,
        SystemClass::LparPowerPc,
        SystemClass::PowerVm,
        SystemClass::StorageArray,
        SystemClass::FcSwitch,
        SystemClass::NetworkSwitch,
        SystemClass::OmniPathSwitch,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemClass::BareMetal => "BareMetal",
            SystemClass::Kvm => "KVM",
            SystemClass::Xen => "XEN",
            SystemClass::Hmc => "HMC",
            SystemClass::ZVm => "zVM",
            SystemClass::ZKvm => "zKVM",
            SystemClass::LparZSeries => "LPAR zSeries",
            SystemClass::LparPowerPc => "LPAR PowerPC",
            SystemClass::PowerVm => "PowerVM",
            SystemClass::StorageArray => "Storage Array",
            SystemClass::FcSwitch => "FC Switch",
            SystemClass::NetworkSwitch => "Network Switch",
            SystemClass::OmniPathSwitch => "Omni-Path Switch",
        }
    }
}

impl fmt::Display for SystemClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case, space, dash and underscore insensitive, so `lpar_zseries` and
/// `LPAR zSeries` name the same class
impl FromStr for SystemClass {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalize(s);
        SystemClass::ALL
            .into_iter()
            .find(|class| normalize(class.as_str()) == wanted)
            .ok_or_else(|| CoreError::validation(format!("unknown system class: {s}")))
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, ' ' | '-' | '_'))
        .flat_map(char::to_lowercase)
        .collect()
}

const X86_64_SYSTEMS: &[SystemClass] = &[
    SystemClass::BareMetal,
    SystemClass::Kvm,
    SystemClass::Xen,
    SystemClass::Hmc,
];

const S390X_SYSTEMS: &[SystemClass] = &[
    SystemClass::ZVm,
    SystemClass::ZKvm,
    SystemClass::LparZSeries,
];

const POWER_SYSTEMS: &[SystemClass] = &[
    SystemClass::LparPowerPc,
    SystemClass::PowerVm,
    SystemClass::Kvm,
    SystemClass::Hmc,
    SystemClass::BareMetal,
];

const AARCH64_SYSTEMS: &[SystemClass] = &[SystemClass::BareMetal, SystemClass::Kvm];

const EMBEDDED_SYSTEMS: &[SystemClass] = &[
    SystemClass::BareMetal,
    SystemClass::StorageArray,
    SystemClass::FcSwitch,
    SystemClass::NetworkSwitch,
    SystemClass::OmniPathSwitch,
];

/// System classes an architecture may run as
#[must_use]
pub fn allowed_systems(architecture: Architecture) -> &'static [SystemClass] {
    match architecture {
        Architecture::X86_64 => X86_64_SYSTEMS,
        Architecture::S390x => S390X_SYSTEMS,
        Architecture::Ppc64 | Architecture::Ppc64le => POWER_SYSTEMS,
        Architecture::Aarch64 => AARCH64_SYSTEMS,
        Architecture::Embedded => EMBEDDED_SYSTEMS,
    }
}

#[must_use]
pub fn is_compatible(architecture: Architecture, system: SystemClass) -> bool {
    allowed_systems(architecture).contains(&system)
}

/// Allowed set for a free-form architecture name; unknown names allow nothing
#[must_use]
pub fn allowed_systems_by_name(architecture: &str) -> &'static [SystemClass] {
    match architecture.parse::<Architecture>() {
        Ok(architecture) => allowed_systems(architecture),
        Err(_) => &[],
    }
}

/// String-level check used by collaborators validating form input
#[must_use]
pub fn validate_configuration(architecture: &str, system: &str) -> bool {
    match system.parse::<SystemClass>() {
        Ok(system) => allowed_systems_by_name(architecture).contains(&system),
        Err(_) => false,
    }
}

/// Reject an (architecture, system) pair with a `Validation` error
///
/// # Errors
/// Returns `CoreError::Validation` when `system` is not allowed on `architecture`
pub fn ensure_compatible(architecture: Architecture, system: SystemClass) -> Result<(), CoreError> {
    if is_compatible(architecture, system) {
        Ok(())
    } else {
        Err(CoreError::validation(format!(
            "system {system} is not allowed on architecture {architecture}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_matches_table() {
        let table: &[(Architecture, &[&str])] = &[
            (Architecture::X86_64, &["BareMetal", "KVM", "XEN", "HMC"]),
            (Architecture::S390x, &["zVM", "zKVM", "LPAR zSeries"]),
            (
                Architecture::Ppc64,
                &["LPAR PowerPC", "PowerVM", "KVM", "HMC", "BareMetal"],
            ),
            (
                Architecture::Ppc64le,
                &["LPAR PowerPC", "PowerVM", "KVM", "HMC", "BareMetal"],
            ),
            (Architecture::Aarch64, &["BareMetal", "KVM"]),
            (
                Architecture::Embedded,
                &[
                    "BareMetal",
                    "Storage Array",
                    "FC Switch",
                    "Network Switch",
                    "Omni-Path Switch",
                ],
            ),
        ];

        for (arch, allowed) in table {
            for system in SystemClass::ALL {
                let expected = allowed.contains(&system.as_str());
                assert_eq!(
                    is_compatible(*arch, system),
                    expected,
                    "{arch} / {system}"
                );
            }
        }
    }

    #[test]
    fn test_examples() {
        assert!(is_compatible(Architecture::X86_64, SystemClass::Hmc));
        assert!(!is_compatible(Architecture::S390x, SystemClass::Kvm));
        assert!(!is_compatible(Architecture::Embedded, SystemClass::Kvm));
    }

    #[test]
    fn test_unknown_architecture_allows_nothing() {
        assert!(allowed_systems_by_name("riscv64").is_empty());
        assert!(!validate_configuration("riscv64", "BareMetal"));
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(
            "lpar_zseries".parse::<SystemClass>().unwrap(),
            SystemClass::LparZSeries
        );
        assert_eq!("kvm".parse::<SystemClass>().unwrap(), SystemClass::Kvm);
        assert_eq!(
            "X86_64".parse::<Architecture>().unwrap(),
            Architecture::X86_64
        );
        assert!("toaster".parse::<SystemClass>().is_err());
    }

    #[test]
    fn test_validate_configuration_strings() {
        assert!(validate_configuration("s390x", "zKVM"));
        assert!(!validate_configuration("aarch64", "XEN"));
        assert!(!validate_configuration("x86_64", "toaster"));
    }

    #[test]
    fn test_serde_uses_display_names() {
        let json = serde_json::to_string(&SystemClass::OmniPathSwitch).unwrap();
        assert_eq!(json, "\"Omni-Path Switch\"");
        let arch: Architecture = serde_json::from_str("\"ppc64le\"").unwrap();
        assert_eq!(arch, Architecture::Ppc64le);
    }
}
