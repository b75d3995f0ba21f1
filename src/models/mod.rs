/// Radiograph classifier network
use candle_core::{DType, Device, ModuleT, Result, Tensor, Var};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Dropout, Linear, Module, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::task::{HeadActivation, TaskMode};

pub mod loader;

/// Variable prefix of the replaceable output head
pub const HEAD_PREFIX: &str = "classifier";
/// Variable prefix of the convolutional backbone
pub const BACKBONE_PREFIX: &str = "features";

/// Backbone hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// Output channels of each stride-2 conv block
    pub channels: Vec<usize>,
    /// Dropout before the head
    pub dropout: f32,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            channels: vec![32, 64, 128, 256],
            dropout: 0.2,
        }
    }
}

impl BackboneConfig {
    /// Width of the pooled feature vector fed to the head
    pub fn num_features(&self) -> usize {
        self.channels.last().copied().unwrap_or(3)
    }
}

/// Everything needed to rebuild a network before loading its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureDescriptor {
    pub backbone: BackboneConfig,
    pub task_mode: TaskMode,
    pub num_outputs: usize,
}

/// Differentiable image classifier driven by the training loop
pub trait Network {
    /// Map [batch, 3, H, W] images to [batch, num_outputs] scores
    ///
    /// Scores are already squashed by the head activation.
    fn forward(&self, images: &Tensor) -> Result<Tensor>;

    /// Switch between training (dropout, batch statistics) and inference mode
    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    /// Parameters handed to the optimizer
    fn trainable_vars(&self) -> Vec<Var>;

    /// Named parameter snapshot for checkpointing
    fn named_tensors(&self) -> crate::Result<HashMap<String, Tensor>>;

    /// Overwrite parameters from a snapshot
    fn restore(&mut self, tensors: &HashMap<String, Tensor>) -> crate::Result<()>;

    fn descriptor(&self) -> ArchitectureDescriptor;
}

/// Copy every variable of a VarMap into a name -> tensor map
pub fn varmap_tensors(varmap: &VarMap) -> crate::Result<HashMap<String, Tensor>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| crate::CxrError::Model("variable map lock poisoned".to_string()))?;

    let mut tensors = HashMap::new();
    for (name, var) in data.iter() {
        tensors.insert(name.clone(), var.as_tensor().copy()?);
    }
    Ok(tensors)
}

/// Set every variable of a VarMap from a name -> tensor map
///
/// Every variable must be present in `tensors` with a matching shape.
pub fn restore_varmap(varmap: &VarMap, tensors: &HashMap<String, Tensor>) -> crate::Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| crate::CxrError::Model("variable map lock poisoned".to_string()))?;

    for (name, var) in data.iter() {
        let value = tensors
            .get(name)
            .ok_or_else(|| crate::CxrError::Model(format!("missing parameter {}", name)))?;
        if value.dims() != var.dims() {
            return Err(crate::CxrError::Model(format!(
                "shape mismatch for {}: expected {:?}, got {:?}",
                name,
                var.dims(),
                value.dims()
            )));
        }
        var.set(&value.to_device(var.device())?.to_dtype(var.dtype())?)?;
    }
    Ok(())
}

/// Conv -> batch norm -> relu, halving the resolution
struct ConvBlock {
    conv: Conv2d,
    norm: BatchNorm,
}

impl ConvBlock {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let config = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let conv = candle_nn::conv2d_no_bias(in_channels, out_channels, 3, config, vb.pp("conv"))?;
        let norm = candle_nn::batch_norm(out_channels, candle_nn::BatchNormConfig::default(), vb.pp("norm"))?;
        Ok(Self { conv, norm })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.conv.forward(x)?;
        self.norm.forward_t(&x, train)?.relu()
    }
}

/// Output head: linear layer plus task activation
pub struct ClassifierHead {
    linear: Linear,
    activation: HeadActivation,
}

impl ClassifierHead {
    pub fn new(in_features: usize, num_outputs: usize, activation: HeadActivation, vb: VarBuilder) -> Result<Self> {
        let linear = candle_nn::linear(in_features, num_outputs, vb)?;
        Ok(Self { linear, activation })
    }

    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let logits = self.linear.forward(features)?;
        match self.activation {
            HeadActivation::Sigmoid => candle_nn::ops::sigmoid(&logits),
            HeadActivation::Softmax => candle_nn::ops::softmax(&logits, candle_core::D::Minus1),
        }
    }
}

/// Convolutional radiograph classifier with a replaceable head
pub struct CxrNet {
    varmap: VarMap,
    backbone_config: BackboneConfig,
    blocks: Vec<ConvBlock>,
    dropout: Dropout,
    head: ClassifierHead,
    task_mode: TaskMode,
    num_outputs: usize,
    training: bool,
    device: Device,
}

impl CxrNet {
    /// Create a freshly initialised network
    pub fn new(descriptor: &ArchitectureDescriptor, device: &Device) -> crate::Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let mut blocks = Vec::with_capacity(descriptor.backbone.channels.len());
        let mut in_channels = 3;
        for (i, &out_channels) in descriptor.backbone.channels.iter().enumerate() {
            blocks.push(ConvBlock::new(
                in_channels,
                out_channels,
                vb.pp(BACKBONE_PREFIX).pp(format!("block_{}", i)),
            )?);
            in_channels = out_channels;
        }

        let head = ClassifierHead::new(
            descriptor.backbone.num_features(),
            descriptor.num_outputs,
            descriptor.task_mode.head_activation(),
            vb.pp(HEAD_PREFIX),
        )?;

        Ok(Self {
            varmap,
            backbone_config: descriptor.backbone.clone(),
            blocks,
            dropout: Dropout::new(descriptor.backbone.dropout),
            head,
            task_mode: descriptor.task_mode,
            num_outputs: descriptor.num_outputs,
            training: true,
            device: device.clone(),
        })
    }

    /// Rebuild a network from a descriptor and stored parameters
    pub fn from_parameters(
        descriptor: &ArchitectureDescriptor,
        tensors: &HashMap<String, Tensor>,
        device: &Device,
    ) -> crate::Result<Self> {
        let mut model = Self::new(descriptor, device)?;
        model.restore(tensors)?;
        Ok(model)
    }

    /// Swap the output head for a freshly initialised one
    pub fn replace_head(&mut self, task_mode: TaskMode, num_outputs: usize) -> crate::Result<()> {
        {
            let mut data = self
                .varmap
                .data()
                .lock()
                .map_err(|_| crate::CxrError::Model("variable map lock poisoned".to_string()))?;
            let prefix = format!("{}.", HEAD_PREFIX);
            data.retain(|name, _| !name.starts_with(&prefix));
        }

        let vb = VarBuilder::from_varmap(&self.varmap, DType::F32, &self.device);
        self.head = ClassifierHead::new(
            self.backbone_config.num_features(),
            num_outputs,
            task_mode.head_activation(),
            vb.pp(HEAD_PREFIX),
        )?;
        self.task_mode = task_mode;
        self.num_outputs = num_outputs;
        Ok(())
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl Network for CxrNet {
    fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let mut x = images.clone();
        for block in &self.blocks {
            x = block.forward_t(&x, self.training)?;
        }

        // Global average pooling: [batch, channels, h, w] -> [batch, channels]
        let pooled = x.mean((2, 3))?;
        let pooled = self.dropout.forward_t(&pooled, self.training)?;

        self.head.forward(&pooled)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    fn named_tensors(&self) -> crate::Result<HashMap<String, Tensor>> {
        varmap_tensors(&self.varmap)
    }

    fn restore(&mut self, tensors: &HashMap<String, Tensor>) -> crate::Result<()> {
        restore_varmap(&self.varmap, tensors)
    }

    fn descriptor(&self) -> ArchitectureDescriptor {
        ArchitectureDescriptor {
            backbone: self.backbone_config.clone(),
            task_mode: self.task_mode,
            num_outputs: self.num_outputs,
        }
    }
}
