use candle_core::DType;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

/// Device requested in template attributes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Cuda,
}

serde_plain::derive_display_from_serialize!(DeviceKind);
serde_plain::derive_fromstr_from_deserialize!(DeviceKind);

impl From<DeviceKind> for DeviceMap {
    fn from(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Cpu => DeviceMap::ForceCpu,
            DeviceKind::Cuda => DeviceMap::Ordinal(0),
        }
    }
}

/// Numeric precision of the loaded weights.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Float16,
    Float32,
}

serde_plain::derive_display_from_serialize!(Precision);
serde_plain::derive_fromstr_from_deserialize!(Precision);

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::Float16 => DType::F16,
            Precision::Float32 => DType::F32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lowercase_names() {
        assert_eq!("cuda".parse::<DeviceKind>().unwrap(), DeviceKind::Cuda);
        assert_eq!("float32".parse::<Precision>().unwrap(), Precision::Float32);
        assert!("tpu".parse::<DeviceKind>().is_err());
        assert!("bfloat16".parse::<Precision>().is_err());
    }

    #[test]
    fn displays_config_names() {
        assert_eq!(DeviceKind::Cpu.to_string(), "cpu");
        assert_eq!(Precision::Float16.to_string(), "float16");
    }

    #[test]
    fn maps_to_device_map_and_dtype() {
        assert_eq!(DeviceMap::from(DeviceKind::Cpu), DeviceMap::ForceCpu);
        assert_eq!(DeviceMap::from(DeviceKind::Cuda), DeviceMap::Ordinal(0));
        assert_eq!(Precision::Float16.dtype(), DType::F16);
        assert_eq!(Precision::Float32.dtype(), DType::F32);
    }
}
