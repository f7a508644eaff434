//! Checkpoint → blob → virtual accelerator → accuracy

use toynet_driver::{Accelerator, AcceleratorImage, InferenceSession, InputBatch, SessionState};
use toynet_models::{softmax, AccuracyEvaluator, Checkpoint, LayerParams, Tensor, WeightSerializer};

const SAMPLE_LEN: usize = 784;

#[test]
fn zero_weights_give_uniform_softmax() {
    let blob = WeightSerializer::reference().serialize(&Checkpoint::zeros()).unwrap();
    let mut acc = Accelerator::open(AcceleratorImage::software("smoke")).unwrap();
    let mut session = InferenceSession::new(&mut acc).unwrap();
    session.load_weights(&blob).unwrap();
    assert_eq!(session.state(), SessionState::Ready);

    let out = session
        .infer_serial(&InputBatch::new(vec![0.0; SAMPLE_LEN]).unwrap())
        .unwrap();
    let probs = softmax(&out.outputs[0].scores);
    assert_eq!(probs.len(), 10);
    assert!(probs.iter().all(|p| (p - 0.1).abs() < 1e-6), "{probs:?}");
}

#[test]
fn final_bias_decides_the_class() {
    // Everything zero except fc2's bias: every sample predicts class 4
    let mut checkpoint = Checkpoint::zeros();
    let mut bias = vec![0.0; 10];
    bias[4] = 1.0;
    checkpoint.insert(
        "fc2",
        LayerParams::Linear {
            weight: Tensor::zeros(&[10, 84]),
            bias: Tensor::new(vec![10], bias).unwrap(),
        },
    );
    let blob = WeightSerializer::reference().serialize(&checkpoint).unwrap();

    let mut acc = Accelerator::open(AcceleratorImage::software("bias")).unwrap();
    let mut session = InferenceSession::new(&mut acc).unwrap();
    session.load_weights(&blob).unwrap();

    let batch = InputBatch::new(vec![0.3; SAMPLE_LEN * 4]).unwrap();
    let out = session.infer_pipelined(&batch).unwrap();

    let mut eval = AccuracyEvaluator::new();
    assert_eq!(eval.record_batch(&out, &[4, 4, 1, 4]).unwrap(), 3);
    assert_eq!(eval.report().correct, 3);
    assert_eq!(eval.report().total, 4);
}

#[test]
fn checkpoint_file_to_blob() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("toynet.json");
    Checkpoint::zeros().save(&path).unwrap();
    let blob = WeightSerializer::reference()
        .serialize(&Checkpoint::from_file(&path).unwrap())
        .unwrap();
    assert_eq!(blob.len(), 61_750);
}
