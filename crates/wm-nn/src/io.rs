// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Parameter snapshots for checkpointing encoders outside the training loop.

use crate::module::Parameterized;
use crate::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::debug;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl StoredTensor {
    fn from_tensor(tensor: &Tensor) -> StoredTensor {
        let (rows, cols) = tensor.shape();
        StoredTensor {
            rows,
            cols,
            data: tensor.data().to_vec(),
        }
    }

    fn into_tensor(self) -> PureResult<Tensor> {
        Tensor::from_vec(self.rows, self.cols, self.data)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ModuleSnapshot {
    parameters: HashMap<String, StoredTensor>,
}

fn to_snapshot<M: Parameterized + ?Sized>(module: &M) -> PureResult<ModuleSnapshot> {
    let parameters = module
        .state_dict()?
        .iter()
        .map(|(name, tensor)| (name.clone(), StoredTensor::from_tensor(tensor)))
        .collect();
    Ok(ModuleSnapshot { parameters })
}

fn restore<M: Parameterized + ?Sized>(module: &mut M, snapshot: ModuleSnapshot) -> PureResult<()> {
    let mut state = HashMap::with_capacity(snapshot.parameters.len());
    for (name, tensor) in snapshot.parameters {
        state.insert(name, tensor.into_tensor()?);
    }
    module.load_state_dict(&state)
}

fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}

pub fn save_json<M: Parameterized + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    let snapshot = to_snapshot(module)?;
    let file = File::create(path.as_ref()).map_err(io_error)?;
    serde_json::to_writer_pretty(BufWriter::new(file), &snapshot).map_err(serde_error)?;
    debug!(path = %path.as_ref().display(), tensors = snapshot.parameters.len(), "saved json snapshot");
    Ok(())
}

pub fn load_json<M: Parameterized + ?Sized, P: AsRef<Path>>(
    module: &mut M,
    path: P,
) -> PureResult<()> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let snapshot: ModuleSnapshot =
        serde_json::from_reader(BufReader::new(file)).map_err(serde_error)?;
    restore(module, snapshot)
}

pub fn save_bincode<M: Parameterized + ?Sized, P: AsRef<Path>>(
    module: &M,
    path: P,
) -> PureResult<()> {
    let snapshot = to_snapshot(module)?;
    let file = File::create(path.as_ref()).map_err(io_error)?;
    bincode::serialize_into(BufWriter::new(file), &snapshot).map_err(serde_error)?;
    debug!(path = %path.as_ref().display(), tensors = snapshot.parameters.len(), "saved bincode snapshot");
    Ok(())
}

pub fn load_bincode<M: Parameterized + ?Sized, P: AsRef<Path>>(
    module: &mut M,
    path: P,
) -> PureResult<()> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let snapshot: ModuleSnapshot =
        bincode::deserialize_from(BufReader::new(file)).map_err(serde_error)?;
    restore(module, snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::conv::Conv2d;
    use tempfile::tempdir;

    fn conv(seed: u64) -> Conv2d {
        Conv2d::with_seed("io", 2, 3, (3, 3), (1, 1), (1, 1), (4, 4), Some(seed)).unwrap()
    }

    #[test]
    fn save_and_load_roundtrip_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conv.json");
        let source = conv(1);
        save_json(&source, &path).unwrap();
        let mut target = conv(2);
        assert_ne!(source.state_dict().unwrap(), target.state_dict().unwrap());
        load_json(&mut target, &path).unwrap();
        assert_eq!(source.state_dict().unwrap(), target.state_dict().unwrap());
    }

    #[test]
    fn save_and_load_roundtrip_bincode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conv.bin");
        let source = conv(3);
        save_bincode(&source, &path).unwrap();
        let mut target = conv(4);
        load_bincode(&mut target, &path).unwrap();
        assert_eq!(source.state_dict().unwrap(), target.state_dict().unwrap());
        assert_eq!(target.state_dict().unwrap().len(), 2);
    }

    #[test]
    fn missing_file_surfaces_io_error() {
        let dir = tempdir().unwrap();
        let mut target = conv(5);
        let err = load_json(&mut target, dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, TensorError::IoError { .. }));
    }
}
