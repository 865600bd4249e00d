// SPDX-License-Identifier: CEPL-1.0
use crate::error::PipelineError;
use crate::hal::{AdapterInfo, Backend, FeatureLevel};
use tracing::{debug, info};

/// An adapter that passed the probe. Lives only until the device is made.
pub struct SelectedAdapter<B: Backend> {
    pub adapter: B::Adapter,
    pub info: AdapterInfo,
}

/// First hardware adapter, by increasing index, that can host a device at
/// `level`. Software adapters are never considered.
pub fn select_adapter<B: Backend>(
    backend: &mut B,
    level: FeatureLevel,
) -> Result<SelectedAdapter<B>, PipelineError> {
    let mut index = 0;
    while let Some(adapter) = backend.enum_adapter(index) {
        index += 1;
        let info = backend.adapter_info(&adapter);
        if info.software {
            debug!("adapter {} ({}) is software, skipping", info.index, info.name);
            continue;
        }
        if backend.probe_feature_level(&adapter, level) {
            info!("adapter {} ({}) supports {}", info.index, info.name, level);
            return Ok(SelectedAdapter { adapter, info });
        }
        debug!("adapter {} ({}) lacks feature level {}", info.index, info.name, level);
    }
    Err(PipelineError::AdapterNotFound(level))
}
