//! Wire-framing round trips and malformed-frame rejection.

use std::collections::BTreeSet;

use candle_core::{DType, Device, Tensor};

use pipegraph::codec::{decode_value, encode_value};
use pipegraph::{PipelineError, Value};

fn assert_tensor_eq(a: &Tensor, b: &Tensor) {
    assert_eq!(a.dims(), b.dims());
    assert_eq!(a.dtype(), b.dtype());
    let a = a
        .contiguous()
        .unwrap()
        .to_dtype(DType::F64)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f64>()
        .unwrap();
    let b = b
        .contiguous()
        .unwrap()
        .to_dtype(DType::F64)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f64>()
        .unwrap();
    assert_eq!(a, b);
}

fn round_trip(value: &Value) -> Value {
    decode_value(&encode_value(value).unwrap()).unwrap()
}

#[test]
fn f32_matrix_round_trips() {
    let t = Tensor::from_vec((0..6).map(|i| i as f32 * 0.5).collect(), (2, 3), &Device::Cpu).unwrap();
    let back = round_trip(&Value::Tensor(t.clone()));
    let Value::Tensor(back) = back else { panic!("not a tensor") };
    assert_tensor_eq(&t, &back);
}

#[test]
fn every_supported_dtype_round_trips() {
    let base = Tensor::from_vec(vec![0f32, 1.5, -2.25, 7.0], (4,), &Device::Cpu).unwrap();
    for dtype in [
        DType::F32,
        DType::F64,
        DType::F16,
        DType::BF16,
        DType::U8,
        DType::I64,
        DType::U32,
    ] {
        let t = base.abs().unwrap().to_dtype(dtype).unwrap();
        let Value::Tensor(back) = round_trip(&Value::Tensor(t.clone())) else {
            panic!("not a tensor")
        };
        assert_tensor_eq(&t, &back);
    }
}

#[test]
fn strided_view_is_made_contiguous_on_the_wire() {
    let t = Tensor::from_vec((0..6).map(|i| i as f32).collect(), (2, 3), &Device::Cpu).unwrap();
    let view = t.t().unwrap();
    assert!(!view.is_contiguous());
    let Value::Tensor(back) = round_trip(&Value::Tensor(view.clone())) else {
        panic!("not a tensor")
    };
    assert_tensor_eq(&view, &back);
}

#[test]
fn nested_composite_round_trips() {
    let t = Tensor::from_vec(vec![1f32, 2.0], (2,), &Device::Cpu).unwrap();
    let value = Value::Tuple(vec![
        Value::Tensor(t.clone()),
        Value::List(vec![Value::Int(-4), Value::Int(9)]),
        Value::Shape(vec![2, 3, 4]),
        Value::Set(BTreeSet::from([3, 1, 2])),
    ]);

    let Value::Tuple(back) = round_trip(&value) else { panic!("not a tuple") };
    assert_eq!(back.len(), 4);
    let Value::Tensor(bt) = &back[0] else { panic!("not a tensor") };
    assert_tensor_eq(&t, bt);
    let Value::List(ints) = &back[1] else { panic!("not a list") };
    assert!(matches!(ints[0], Value::Int(-4)));
    assert!(matches!(ints[1], Value::Int(9)));
    let Value::Shape(dims) = &back[2] else { panic!("not a shape") };
    assert_eq!(dims, &[2, 3, 4]);
    let Value::Set(set) = &back[3] else { panic!("not a set") };
    assert_eq!(set.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
}

#[test]
fn unknown_tag_is_rejected() {
    let frame = 999u64.to_le_bytes().to_vec();
    assert!(matches!(
        decode_value(&frame),
        Err(PipelineError::Encoding(_))
    ));
}

#[test]
fn unsupported_element_type_id_is_rejected() {
    // A 1-element tensor claiming element-type id 2, which has no local
    // representation.
    let mut frame = Vec::new();
    frame.extend_from_slice(&100u64.to_le_bytes()); // tensor tag
    frame.extend_from_slice(&1u64.to_le_bytes()); // rank
    frame.extend_from_slice(&1u64.to_le_bytes()); // dim
    frame.extend_from_slice(&2u64.to_le_bytes()); // element-type id
    frame.extend_from_slice(&[0u8; 8]);
    assert!(matches!(
        decode_value(&frame),
        Err(PipelineError::Encoding(_))
    ));
}

#[test]
fn truncated_frame_is_rejected() {
    let t = Tensor::from_vec(vec![1f32, 2.0, 3.0], (3,), &Device::Cpu).unwrap();
    let mut frame = encode_value(&Value::Tensor(t)).unwrap();
    frame.truncate(frame.len() - 4);
    assert!(matches!(
        decode_value(&frame),
        Err(PipelineError::Encoding(_))
    ));
}

#[test]
fn trailing_bytes_are_rejected() {
    let mut frame = encode_value(&Value::Int(3)).unwrap();
    frame.push(0);
    assert!(matches!(
        decode_value(&frame),
        Err(PipelineError::Encoding(_))
    ));
}
