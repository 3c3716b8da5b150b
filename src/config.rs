// This file is part of a DASH/CMAF fragmented-MP4 + CENC packager core.

//! The packager's configuration record.
//!
//! This is a passive value type populated by the (out-of-scope) CLI
//! collaborator, modeled with `serde` the same way other JSON config/API
//! records in this codebase are, rather than as a `bpaf` argument parser —
//! flag parsing belongs to that excluded collaborator.

use crate::model::ProtectionScheme;
use serde::{Deserialize, Serialize};

fn default_segment_sap_aligned() -> bool {
    true
}

fn default_fragment_sap_aligned() -> bool {
    true
}

/// How `sidx` subsegment references are packed.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SidxMode {
    /// `num_subsegments_per_sidx < 0`: no `sidx` is written.
    Disabled,
    /// `num_subsegments_per_sidx == 0`: one reference per fragment.
    OnePerFragment,
    /// `num_subsegments_per_sidx == N > 0`: coalesce references into
    /// exactly `N` subsegments.
    Coalesce(u32),
}

impl SidxMode {
    pub fn from_config_value(v: i32) -> SidxMode {
        match v {
            n if n < 0 => SidxMode::Disabled,
            0 => SidxMode::OnePerFragment,
            n => SidxMode::Coalesce(n as u32),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PackagerConfig {
    /// Init file in multi-file mode; full file in single-file mode.
    pub output_file_name: String,

    /// Pattern for segment file names; empty selects single-file mode.
    /// Supports `$Number$`, `$Time$`, `$Bandwidth$`, `$RepresentationID$`,
    /// each with an optional width specifier, e.g. `$Number%05d$`.
    #[serde(default)]
    pub segment_template: String,

    /// Target segment length, in seconds; cuts align to the next SAP.
    pub segment_duration: f64,

    /// Target fragment length within a segment, in seconds.
    pub fragment_duration: f64,

    #[serde(default = "default_segment_sap_aligned")]
    pub segment_sap_aligned: bool,

    #[serde(default = "default_fragment_sap_aligned")]
    pub fragment_sap_aligned: bool,

    /// -1 disables `sidx`; 0 emits one reference per fragment; N coalesces
    /// to exactly N references.
    #[serde(default)]
    pub num_subsegments_per_sidx: i32,

    /// Used in segment-name templating only; not validated against the
    /// actual encoded bitrate.
    #[serde(default)]
    pub bandwidth: u64,

    #[serde(default)]
    pub protection: Option<EncryptionConfig>,
}

impl PackagerConfig {
    pub fn sidx_mode(&self) -> SidxMode {
        SidxMode::from_config_value(self.num_subsegments_per_sidx)
    }

    pub fn is_single_file(&self) -> bool {
        self.segment_template.is_empty()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub scheme: ConfigProtectionScheme,
    /// Pattern parameters; both 0 for non-pattern schemes.
    #[serde(default)]
    pub crypt_byte_block: u8,
    #[serde(default)]
    pub skip_byte_block: u8,
}

/// `serde`-friendly mirror of [`ProtectionScheme`] (the latter has no
/// `serde` derive since it's used on hot encryption paths and this avoids
/// pulling a serde dependency onto that type for a config-only concern).
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigProtectionScheme {
    Cenc,
    Cens,
    Cbc1,
    Cbcs,
}

impl From<ConfigProtectionScheme> for ProtectionScheme {
    fn from(s: ConfigProtectionScheme) -> ProtectionScheme {
        match s {
            ConfigProtectionScheme::Cenc => ProtectionScheme::Cenc,
            ConfigProtectionScheme::Cens => ProtectionScheme::Cens,
            ConfigProtectionScheme::Cbc1 => ProtectionScheme::Cbc1,
            ConfigProtectionScheme::Cbcs => ProtectionScheme::Cbcs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidx_mode_from_config_value() {
        assert_eq!(SidxMode::from_config_value(-1), SidxMode::Disabled);
        assert_eq!(SidxMode::from_config_value(0), SidxMode::OnePerFragment);
        assert_eq!(SidxMode::from_config_value(3), SidxMode::Coalesce(3));
    }

    #[test]
    fn deserializes_minimal_json() {
        let json = r#"{
            "output_file_name": "init.mp4",
            "segment_duration": 4.0,
            "fragment_duration": 2.0
        }"#;
        let cfg: PackagerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.output_file_name, "init.mp4");
        assert!(cfg.is_single_file());
        assert!(cfg.protection.is_none());
        assert!(cfg.segment_sap_aligned);
    }

    #[test]
    fn deserializes_with_protection() {
        let json = r#"{
            "output_file_name": "init.mp4",
            "segment_template": "seg-$Number%05d$.m4s",
            "segment_duration": 4.0,
            "fragment_duration": 2.0,
            "num_subsegments_per_sidx": 3,
            "protection": { "scheme": "cbcs", "crypt_byte_block": 1, "skip_byte_block": 9 }
        }"#;
        let cfg: PackagerConfig = serde_json::from_str(json).unwrap();
        assert!(!cfg.is_single_file());
        assert_eq!(cfg.sidx_mode(), SidxMode::Coalesce(3));
        let protection = cfg.protection.unwrap();
        assert_eq!(protection.crypt_byte_block, 1);
        assert_eq!(protection.skip_byte_block, 9);
        let scheme: ProtectionScheme = protection.scheme.into();
        assert_eq!(scheme, ProtectionScheme::Cbcs);
    }
}
