use std::time::Instant;

use candle_core::Device;

#[cfg(test)]
thread_local! {
    static RELEASED: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// Brackets a model load or an inference call.
///
/// Transient tensors created inside the scope are dropped before the guard, and the
/// guard synchronizes the device when it goes out of scope so queued kernels release
/// their buffers on every exit path, errors included.
pub struct DeviceScope<'a> {
    device: &'a Device,
    label: &'static str,
    started: Instant,
}

impl<'a> DeviceScope<'a> {
    pub fn enter(device: &'a Device, label: &'static str) -> Self {
        tracing::debug!(scope = label, device = ?device, "entering device scope");
        Self {
            device,
            label,
            started: Instant::now(),
        }
    }
}

impl Drop for DeviceScope<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.device.synchronize() {
            tracing::warn!(scope = self.label, "failed to synchronize device: {err}");
        }
        tracing::debug!(
            scope = self.label,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "released device scope"
        );
        #[cfg(test)]
        RELEASED.with(|released| released.set(released.get() + 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_releases_on_early_return() {
        fn fails(device: &Device) -> anyhow::Result<()> {
            let _scope = DeviceScope::enter(device, "test");
            anyhow::bail!("boom")
        }
        let before = RELEASED.with(|released| released.get());
        assert!(fails(&Device::Cpu).is_err());
        assert_eq!(RELEASED.with(|released| released.get()), before + 1);
    }

    #[test]
    fn nested_scopes_release_inner_first() {
        let before = RELEASED.with(|released| released.get());
        {
            let _outer = DeviceScope::enter(&Device::Cpu, "outer");
            {
                let _inner = DeviceScope::enter(&Device::Cpu, "inner");
            }
            assert_eq!(RELEASED.with(|released| released.get()), before + 1);
        }
        assert_eq!(RELEASED.with(|released| released.get()), before + 2);
    }
}
