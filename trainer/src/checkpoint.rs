use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};

use log::info;
use machine_learning::{
    arch::ParamLayout, optimization::OptimizerState, scaler::ScalerState,
    schedule::SchedulerState,
};
use safetensors::{
    SafeTensors,
    tensor::{Dtype, TensorView},
};
use serde::{Serialize, de::DeserializeOwned};

use crate::{Result, TrainErr, config::RunConfig};

const MODEL_PREFIX: &str = "model.";
const BUFFER_PREFIX: &str = "buffer.";
const OPTIMIZER_PREFIX: &str = "optimizer.";

/// Everything needed to resume a run after its last completed epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub params: Vec<f32>,
    pub buffers: BTreeMap<String, Vec<f32>>,
    pub optimizer: OptimizerState,
    pub lr_scheduler: SchedulerState,
    pub scaler: Option<ScalerState>,
    /// The last fully completed epoch.
    pub epoch: usize,
    pub max_test_acc1: f64,
    pub args: RunConfig,
}

impl Checkpoint {
    /// Writes the checkpoint as a safetensors file.
    ///
    /// Parameters are split into one tensor per `layout` entry, the scalar
    /// state goes to the file's metadata as json. The file is first written
    /// next to `path` and then renamed over it, so a crash never leaves a
    /// truncated checkpoint behind.
    pub fn save(&self, path: &Path, layout: &ParamLayout) -> Result<()> {
        if self.params.len() != layout.size() {
            return Err(TrainErr::Checkpoint(format!(
                "got {} parameters for a layout of {}",
                self.params.len(),
                layout.size()
            )));
        }

        let mut tensors: Vec<(String, Vec<usize>, &[f32])> = layout
            .entries()
            .iter()
            .map(|e| {
                let name = format!("{MODEL_PREFIX}{}", e.name);
                (name, e.shape.clone(), &self.params[e.range.clone()])
            })
            .collect();

        let buffers = self
            .buffers
            .iter()
            .map(|(name, b)| (format!("{BUFFER_PREFIX}{name}"), vec![b.len()], b.as_slice()));
        let optimizer = self.optimizer.buffers.iter().map(|(name, b)| {
            (format!("{OPTIMIZER_PREFIX}{name}"), vec![b.len()], b.as_slice())
        });
        tensors.extend(buffers.chain(optimizer));

        let views = tensors
            .iter()
            .map(|(name, shape, data)| {
                let bytes = bytemuck::cast_slice::<f32, u8>(data);
                let view = TensorView::new(Dtype::F32, shape.clone(), bytes)?;
                Ok((name.as_str(), view))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut metadata = HashMap::from([
            ("epoch".to_string(), to_json(&self.epoch)?),
            ("max_test_acc1".to_string(), to_json(&self.max_test_acc1)?),
            ("args".to_string(), to_json(&self.args)?),
            ("optimizer".to_string(), to_json(&self.optimizer)?),
            ("lr_scheduler".to_string(), to_json(&self.lr_scheduler)?),
        ]);
        if let Some(scaler) = &self.scaler {
            metadata.insert("scaler".to_string(), to_json(scaler)?);
        }

        let bytes = safetensors::serialize(views, &Some(metadata))?;

        let tmp = tmp_path(path);
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;

        info!(epoch = self.epoch; "saved checkpoint to {}", path.display());
        Ok(())
    }

    /// Reads a checkpoint written by `save` for a model with the given layout.
    pub fn load(path: &Path, layout: &ParamLayout) -> Result<Self> {
        let bytes = fs::read(path)?;
        let (_, header) = SafeTensors::read_metadata(&bytes)?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let tensors = SafeTensors::deserialize(&bytes)?;

        let mut params = vec![0.; layout.size()];
        for entry in layout.entries() {
            let name = format!("{MODEL_PREFIX}{}", entry.name);
            let values = read_tensor(&tensors, &name)?;

            if values.len() != entry.range.len() {
                return Err(TrainErr::Checkpoint(format!(
                    "{name} holds {} values, expected {}",
                    values.len(),
                    entry.range.len()
                )));
            }
            params[entry.range.clone()].copy_from_slice(&values);
        }

        let mut buffers = BTreeMap::new();
        let mut optimizer_buffers = BTreeMap::new();
        for name in tensors.names() {
            if let Some(short) = name.strip_prefix(BUFFER_PREFIX) {
                buffers.insert(short.to_string(), read_tensor(&tensors, name)?);
            } else if let Some(short) = name.strip_prefix(OPTIMIZER_PREFIX) {
                optimizer_buffers.insert(short.to_string(), read_tensor(&tensors, name)?);
            }
        }

        let mut optimizer: OptimizerState = from_json(&metadata, "optimizer")?;
        optimizer.buffers = optimizer_buffers;

        let scaler = if metadata.contains_key("scaler") {
            Some(from_json(&metadata, "scaler")?)
        } else {
            None
        };

        Ok(Self {
            params,
            buffers,
            optimizer,
            lr_scheduler: from_json(&metadata, "lr_scheduler")?,
            scaler,
            epoch: from_json(&metadata, "epoch")?,
            max_test_acc1: from_json(&metadata, "max_test_acc1")?,
            args: from_json(&metadata, "args")?,
        })
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn read_tensor(tensors: &SafeTensors<'_>, name: &str) -> Result<Vec<f32>> {
    let view = tensors
        .tensor(name)
        .map_err(|_| TrainErr::Checkpoint(format!("missing tensor {name}")))?;

    if view.dtype() != Dtype::F32 {
        return Err(TrainErr::Checkpoint(format!(
            "{name} is {:?}, expected F32",
            view.dtype()
        )));
    }

    let values = view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    Ok(values)
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(metadata: &HashMap<String, String>, key: &str) -> Result<T> {
    let raw = metadata
        .get(key)
        .ok_or_else(|| TrainErr::Checkpoint(format!("missing metadata {key}")))?;

    Ok(serde_json::from_str(raw)?)
}
