//! Checkpointing and Serialization.
//!
//! Model parameters are saved by name in the `safetensors` format, each with its real shape.
//! Values are encoded little-endian, as the format requires.

use crate::error::{Error, Result};
use crate::nn::Module;
use crate::tensor::FloatElem;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::debug;

/// Element types that can be written to a checkpoint.
pub trait CheckpointElem: FloatElem {
    const DTYPE: Dtype;

    fn extend_le_bytes(values: &[Self], out: &mut Vec<u8>);

    /// Decodes `bytes`, whose length is a multiple of the element size.
    fn from_le_bytes(bytes: &[u8]) -> Vec<Self>;
}

impl CheckpointElem for f32 {
    const DTYPE: Dtype = Dtype::F32;

    fn extend_le_bytes(values: &[Self], out: &mut Vec<u8>) {
        out.extend(values.iter().flat_map(|v| v.to_le_bytes()));
    }

    fn from_le_bytes(bytes: &[u8]) -> Vec<Self> {
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }
}

impl CheckpointElem for f64 {
    const DTYPE: Dtype = Dtype::F64;

    fn extend_le_bytes(values: &[Self], out: &mut Vec<u8>) {
        out.extend(values.iter().flat_map(|v| v.to_le_bytes()));
    }

    fn from_le_bytes(bytes: &[u8]) -> Vec<Self> {
        bytes
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect()
    }
}

/// A flattened tensor together with its shape.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedTensor<T> {
    pub shape: Vec<usize>,
    pub data: Vec<T>,
}

/// Parameters by name.
pub type StateDict<T> = BTreeMap<String, SavedTensor<T>>;

/// Saves a map of tensors to a safetensors file.
pub fn save_checkpoint<P: AsRef<Path>, T: CheckpointElem>(
    path: P,
    tensors: &StateDict<T>,
) -> Result<()> {
    // Views borrow their bytes, so encode everything first
    let encoded: Vec<(&String, &SavedTensor<T>, Vec<u8>)> = tensors
        .iter()
        .map(|(name, tensor)| {
            let mut bytes = Vec::with_capacity(std::mem::size_of_val(tensor.data.as_slice()));
            T::extend_le_bytes(&tensor.data, &mut bytes);
            (name, tensor, bytes)
        })
        .collect();

    let mut views = BTreeMap::new();
    for (name, tensor, bytes) in &encoded {
        let view = TensorView::new(T::DTYPE, tensor.shape.clone(), bytes)?;
        views.insert(name.as_str(), view);
    }

    safetensors::serialize_to_file(views, &None, path.as_ref())?;
    debug!(path = %path.as_ref().display(), tensors = tensors.len(), "saved checkpoint");
    Ok(())
}

/// Loads a map of tensors from a safetensors file.
///
/// # Errors
///
/// Returns `Error::Checkpoint` when a tensor's dtype is not `T`.
pub fn load_checkpoint<P: AsRef<Path>, T: CheckpointElem>(path: P) -> Result<StateDict<T>> {
    let bytes = std::fs::read(path)?;
    let file = SafeTensors::deserialize(&bytes)?;

    let mut tensors = BTreeMap::new();
    for (name, view) in file.tensors() {
        if view.dtype() != T::DTYPE {
            return Err(Error::Checkpoint(format!(
                "tensor '{}' is {:?}, expected {:?}",
                name,
                view.dtype(),
                T::DTYPE
            )));
        }
        let tensor = SavedTensor {
            shape: view.shape().to_vec(),
            data: T::from_le_bytes(view.data()),
        };
        tensors.insert(name, tensor);
    }
    Ok(tensors)
}

/// Copies every parameter of `module`.
pub fn state_dict<T: FloatElem>(module: &mut dyn Module<T>) -> StateDict<T> {
    let mut tensors = BTreeMap::new();
    module.visit_parameters("", &mut |name, param| {
        tensors.insert(
            name.to_string(),
            SavedTensor {
                shape: param.shape(),
                data: param.values().to_vec(),
            },
        );
    });
    tensors
}

/// Overwrites the parameters of `module` with `tensors`.
///
/// Every parameter must be present with its exact shape. Extra entries are ignored.
pub fn load_state_dict<T: FloatElem>(
    module: &mut dyn Module<T>,
    tensors: &StateDict<T>,
) -> Result<()> {
    let mut problems: HashMap<String, String> = HashMap::new();
    module.visit_parameters("", &mut |name, param| match tensors.get(name) {
        None => {
            problems.insert(name.to_string(), "missing".into());
        }
        Some(saved) if saved.shape != param.shape() || saved.data.len() != param.size() => {
            problems.insert(
                name.to_string(),
                format!("shape {:?}, expected {:?}", saved.shape, param.shape()),
            );
        }
        Some(saved) => param.values_mut().copy_from_slice(&saved.data),
    });

    if problems.is_empty() {
        return Ok(());
    }
    let mut problems: Vec<String> = problems
        .into_iter()
        .map(|(name, problem)| format!("{name}: {problem}"))
        .collect();
    problems.sort();
    Err(Error::Checkpoint(problems.join("; ")))
}

/// Saves the parameters of `module` to `path`.
pub fn save_module<P: AsRef<Path>, T: CheckpointElem>(
    path: P,
    module: &mut dyn Module<T>,
) -> Result<()> {
    save_checkpoint(path, &state_dict(module))
}

/// Loads parameters saved by [`save_module`] into `module`.
pub fn load_module<P: AsRef<Path>, T: CheckpointElem>(
    path: P,
    module: &mut dyn Module<T>,
) -> Result<()> {
    load_state_dict(module, &load_checkpoint(path)?)
}
