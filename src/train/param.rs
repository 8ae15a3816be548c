use std::collections::BTreeMap;

use ndarray::{Array, ArrayD, ArrayViewD, ArrayViewMutD, Dimension, IxDyn};
use serde::{Deserialize, Serialize};

use super::TrainError;

/// Serialisable dense tensor: shape plus row-major values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// Dimensions.
    pub shape: Vec<usize>,
    /// Row-major values.
    pub data: Vec<f32>,
}

impl Tensor {
    /// Snapshot of an array.
    pub fn from_array<D: Dimension>(array: &Array<f32, D>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            data: array.iter().copied().collect(),
        }
    }

    /// Rebuild an array of the requested dimensionality.
    pub fn to_array<D: Dimension>(&self) -> Result<Array<f32, D>, TrainError> {
        let array = ArrayD::from_shape_vec(IxDyn(&self.shape), self.data.clone())
            .map_err(|e| TrainError::State(e.to_string()))?;
        array
            .into_dimensionality::<D>()
            .map_err(|e| TrainError::State(e.to_string()))
    }
}

/// Named model parameters, the on-disk form of a checkpoint.
pub type StateDict = BTreeMap<String, Tensor>;

/// Copy `state[name]` into `target`, keeping its shape.
pub fn load_param<D: Dimension>(
    state: &StateDict,
    name: &str,
    target: &mut Array<f32, D>,
) -> Result<(), TrainError> {
    let tensor = state
        .get(name)
        .ok_or_else(|| TrainError::State(format!("checkpoint lacks parameter '{name}'")))?;
    if tensor.shape != target.shape() {
        return Err(TrainError::State(format!(
            "parameter '{name}' has shape {:?}, model expects {:?}",
            tensor.shape,
            target.shape()
        )));
    }
    let loaded = tensor.to_array::<D>()?;
    target.assign(&loaded);
    Ok(())
}

/// Mutable view of one trainable parameter and its accumulated gradient.
#[derive(Debug)]
pub struct ParamMut<'a> {
    /// Stable parameter name.
    pub name: &'static str,
    /// Parameter values.
    pub value: ArrayViewMutD<'a, f32>,
    /// Gradient accumulated since the last optimizer step.
    pub grad: ArrayViewD<'a, f32>,
}

impl<'a> ParamMut<'a> {
    /// Pair a parameter with its gradient buffer.
    pub fn new<D: Dimension>(
        name: &'static str,
        value: &'a mut Array<f32, D>,
        grad: &'a Array<f32, D>,
    ) -> Self {
        Self {
            name,
            value: value.view_mut().into_dyn(),
            grad: grad.view().into_dyn(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2, Ix2};

    #[test]
    fn tensors_restore_their_shape() {
        let a = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let tensor = Tensor::from_array(&a);
        assert_eq!(tensor.shape, vec![2, 3]);
        assert_eq!(tensor.to_array::<Ix2>().unwrap(), a);
    }

    #[test]
    fn load_param_rejects_shape_changes() {
        let mut state = StateDict::new();
        state.insert("w".to_string(), Tensor::from_array(&Array2::<f32>::ones((2, 2))));
        let mut wrong = Array2::<f32>::zeros((3, 2));
        assert!(matches!(
            load_param(&state, "w", &mut wrong),
            Err(TrainError::State(_))
        ));
        let mut right = Array2::<f32>::zeros((2, 2));
        load_param(&state, "w", &mut right).unwrap();
        assert_eq!(right.sum(), 4.0);
        assert!(load_param(&state, "b", &mut right).is_err());
    }
}
