use candle_core::Device;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceChoice {
    /// CUDA, device 0.
    Cuda,
    /// Metal, device 0.
    Metal,
    Cpu,
}

/// Which accelerator runtimes answered the probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceleratorProbe {
    pub cuda: bool,
    pub metal: bool,
}

impl AcceleratorProbe {
    pub fn detect() -> Self {
        let cuda = candle_core::utils::cuda_is_available() && Device::new_cuda(0).is_ok();
        let metal = candle_core::utils::metal_is_available() && Device::new_metal(0).is_ok();
        Self { cuda, metal }
    }
}

impl DeviceChoice {
    pub fn from_probe(probe: AcceleratorProbe) -> Self {
        if probe.cuda {
            Self::Cuda
        } else if probe.metal {
            Self::Metal
        } else {
            Self::Cpu
        }
    }

    pub fn is_accelerator(self) -> bool {
        !matches!(self, Self::Cpu)
    }

    pub fn open(self) -> candle_core::Result<Device> {
        match self {
            Self::Cuda => Device::new_cuda(0),
            Self::Metal => Device::new_metal(0),
            Self::Cpu => Ok(Device::Cpu),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Metal => "metal",
            Self::Cpu => "cpu",
        }
    }
}

pub fn resolve_device() -> DeviceChoice {
    let probe = AcceleratorProbe::detect();
    let choice = DeviceChoice::from_probe(probe);
    info!(
        cuda = probe.cuda,
        metal = probe.metal,
        device = choice.name(),
        "resolved compute device"
    );
    choice
}

#[cfg(test)]
mod tests {
    use super::{resolve_device, AcceleratorProbe, DeviceChoice};

    #[test]
    fn every_probe_combination_picks_one_device() {
        let cases = [
            (false, false, DeviceChoice::Cpu),
            (false, true, DeviceChoice::Metal),
            (true, false, DeviceChoice::Cuda),
            (true, true, DeviceChoice::Cuda),
        ];
        for (cuda, metal, expected) in cases {
            let choice = DeviceChoice::from_probe(AcceleratorProbe { cuda, metal });
            assert_eq!(choice, expected, "cuda={} metal={}", cuda, metal);
        }
    }

    #[test]
    fn live_probe_is_deterministic() {
        assert_eq!(resolve_device(), resolve_device());
    }

    #[test]
    fn cpu_choice_always_opens() {
        assert!(DeviceChoice::Cpu.open().is_ok());
        assert!(!DeviceChoice::Cpu.is_accelerator());
        assert!(DeviceChoice::Metal.is_accelerator());
    }
}
