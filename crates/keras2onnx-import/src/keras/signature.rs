use onnx_graph::DType;
use crate::keras::model::KerasModel;
use crate::ConversionError;

/// Name, shape and element type the exported graph declares for one input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputSignature {
    pub name: String,
    /// `None` marks a dimension left unspecified, typically the batch.
    pub shape: Vec<Option<usize>>,
    pub dtype: String,
}

impl InputSignature {
    pub fn onnx_dtype(&self) -> Result<DType, ConversionError> {
        onnx_dtype(&self.dtype).ok_or_else(|| ConversionError::UnsupportedDType { name: self.name.clone(), dtype: self.dtype.clone() })
    }
}

/// Element types an exported graph input may carry.
pub fn onnx_dtype(name: &str) -> Option<DType> {
    Some(match name {
        "float32" | "float" => DType::F32,
        "float64" | "double" => DType::F64,
        "float16" | "half" => DType::F16,
        "bfloat16" => DType::BF16,
        "int8" => DType::I8,
        "uint8" => DType::U8,
        "int32" => DType::I32,
        "int64" => DType::I64,
        "bool" => DType::Bool,
        _ => return None,
    })
}

/// Builds the input signature from the model's declared inputs. The first input takes `name`;
/// any further inputs keep their Keras names.
pub fn derive_signature(model: &KerasModel, name: &str) -> Result<Vec<InputSignature>, ConversionError> {
    let (first, rest) = model.inputs.split_first().ok_or(ConversionError::NoModelInputs)?;
    let mut signature = vec![InputSignature { name: name.to_string(), shape: first.shape.clone(), dtype: first.dtype.clone() }];
    signature.extend(rest.iter().map(|input| InputSignature { name: input.name.clone(), shape: input.shape.clone(), dtype: input.dtype.clone() }));
    Ok(signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_keras_dtype_names() {
        assert_eq!(onnx_dtype("float32"), Some(DType::F32));
        assert_eq!(onnx_dtype("uint8"), Some(DType::U8));
        assert_eq!(onnx_dtype("string"), None);
        assert_eq!(onnx_dtype("complex64"), None);
        assert_eq!(onnx_dtype("qint8"), None);
    }

    #[test]
    fn unsupported_dtype_names_the_input() {
        let signature = InputSignature { name: "input".to_string(), shape: vec![None, Some(3)], dtype: "string".to_string() };
        let err = signature.onnx_dtype().unwrap_err();
        assert_eq!(err.to_string(), "Input input has dtype string, which cannot be represented in ONNX");
    }
}
