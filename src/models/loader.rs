/// Pretrained weight loading from safetensors files
use std::path::Path;

use super::{CxrNet, BACKBONE_PREFIX};

/// Load pretrained backbone weights into a network
///
/// Only `features.*` tensors are read; the head keeps its fresh
/// initialisation so it can be sized for the task.
///
/// # Returns
/// Number of tensors loaded
pub fn load_pretrained_backbone<P: AsRef<Path>>(model: &CxrNet, weights_path: P) -> crate::Result<usize> {
    let tensors = candle_core::safetensors::load(weights_path.as_ref(), model.device())?;

    let data = model
        .varmap()
        .data()
        .lock()
        .map_err(|_| crate::CxrError::Model("variable map lock poisoned".to_string()))?;

    let prefix = format!("{}.", BACKBONE_PREFIX);
    let mut loaded = 0;
    for (name, var) in data.iter().filter(|(name, _)| name.starts_with(&prefix)) {
        let value = tensors.get(name).ok_or_else(|| {
            crate::CxrError::Model(format!(
                "pretrained weights {:?} missing {}",
                weights_path.as_ref(),
                name
            ))
        })?;
        var.set(&value.to_dtype(var.dtype())?)?;
        loaded += 1;
    }

    log::info!("Loaded {} pretrained backbone tensors from {:?}", loaded, weights_path.as_ref());
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArchitectureDescriptor, BackboneConfig, Network};
    use crate::task::TaskMode;
    use candle_core::Device;

    #[test]
    fn test_load_pretrained_backbone_keeps_head() -> crate::Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("backbone.safetensors");

        let pretrained = CxrNet::new(
            &ArchitectureDescriptor {
                backbone: BackboneConfig { channels: vec![4], dropout: 0.0 },
                task_mode: TaskMode::MultiLabel,
                num_outputs: 14,
            },
            &device,
        )?;
        pretrained.varmap().save(&path)?;

        let model = CxrNet::new(
            &ArchitectureDescriptor {
                backbone: BackboneConfig { channels: vec![4], dropout: 0.0 },
                task_mode: TaskMode::Orientation,
                num_outputs: 3,
            },
            &device,
        )?;
        let loaded = load_pretrained_backbone(&model, &path)?;
        assert_eq!(loaded, 5); // conv weight + batch norm weight/bias/mean/var

        let expected = pretrained.named_tensors()?;
        let actual = model.named_tensors()?;
        let key = "features.block_0.conv.weight";
        let diff = (&expected[key] - &actual[key])?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        assert_eq!(actual["classifier.weight"].dims(), &[3, 4]);

        Ok(())
    }
}
