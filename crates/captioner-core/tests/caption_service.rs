//! End-to-end request handling against a scripted model.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use captioner_core::model::GenerationPolicy;
use captioner_core::{
    ArtifactError, ArtifactPaths, CaptionError, Captioner, Component, ModelAssembler,
    PipelineError, UploadedFile, ValidationReason,
};

fn captioner(policy: GenerationPolicy) -> (tempfile::TempDir, Captioner, Arc<AtomicUsize>) {
    let dir = tempfile::tempdir().unwrap();
    let (bundle, calls) = common::scripted_bundle(dir.path(), policy);
    let captioner = Captioner::with_bundle(Arc::new(bundle), &common::test_config()).unwrap();
    (dir, captioner, calls)
}

fn upload(name: &str, content_type: &str, bytes: Vec<u8>) -> UploadedFile {
    UploadedFile::new(name, Some(content_type.to_string()), bytes)
}

#[tokio::test]
async fn test_jpeg_upload_is_captioned() {
    let (_dir, captioner, _) = captioner(GenerationPolicy::default());
    let response = captioner
        .respond(upload("cat.jpg", "image/jpeg", common::jpeg_bytes(32, 24)))
        .await;

    assert!(response.is_success());
    assert_eq!(response.message(), "cat");
}

#[tokio::test]
async fn test_text_disguised_as_png_never_reaches_model() {
    let (_dir, captioner, calls) = captioner(GenerationPolicy::default());
    let err = captioner
        .caption(upload("fake.png", "image/png", b"just some text".to_vec()))
        .await
        .unwrap_err();

    match err {
        PipelineError::UnsupportedContent { filename, detected } => {
            assert_eq!(filename, "fake.png");
            assert_eq!(detected, "text/plain");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_declared_type_rejections() {
    let (_dir, captioner, calls) = captioner(GenerationPolicy::default());
    let bytes = common::jpeg_bytes(8, 8);

    let cases = [
        ("cat.gif", "image/jpeg", ValidationReason::BadExtension),
        ("cat.jpg", "image/gif", ValidationReason::BadSignature),
        ("cat.gif", "image/gif", ValidationReason::BadBoth),
    ];
    for (name, content_type, reason) in cases {
        let response = captioner
            .respond(upload(name, content_type, bytes.clone()))
            .await;
        assert!(!response.is_success());
        assert_eq!(response.message(), reason.to_string());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_corrupt_image_does_not_poison_service() {
    let (_dir, captioner, _) = captioner(GenerationPolicy::default());

    let mut corrupt = vec![0xFF, 0xD8, 0xFF, 0xE0];
    corrupt.extend_from_slice(&[0x13; 64]);
    let err = captioner
        .caption(upload("broken.jpg", "image/jpeg", corrupt))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ImageDecode { .. }));

    let response = captioner
        .respond(upload("cat.jpg", "image/jpeg", common::jpeg_bytes(16, 16)))
        .await;
    assert!(response.is_success());
}

#[tokio::test]
async fn test_png_with_alpha_is_captioned() {
    let (_dir, captioner, calls) = captioner(GenerationPolicy::default());
    let response = captioner
        .respond(upload("logo.png", "image/png", common::rgba_png_bytes(10, 6)))
        .await;

    assert!(response.is_success());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_upload_size_limit() {
    let dir = tempfile::tempdir().unwrap();
    let (bundle, calls) = common::scripted_bundle(dir.path(), GenerationPolicy::default());
    let mut config = common::test_config();
    config.limits.max_upload_mb = 1;
    let captioner = Captioner::with_bundle(Arc::new(bundle), &config).unwrap();

    let err = captioner
        .caption(upload("big.jpg", "image/jpeg", vec![0u8; 2 * 1024 * 1024]))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::FileTooLarge { max_mb: 1, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_greedy_and_beam_are_deterministic() {
    let beam = GenerationPolicy {
        num_beams: 2,
        ..Default::default()
    };
    for policy in [GenerationPolicy::default(), beam] {
        let (_dir, captioner, _) = captioner(policy);
        let bytes = common::jpeg_bytes(20, 20);
        let first = captioner
            .caption(upload("a.jpg", "image/jpeg", bytes.clone()))
            .await
            .unwrap();
        let second = captioner
            .caption(upload("a.jpg", "image/jpeg", bytes))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert!(!first[0].is_empty());
    }
}

#[tokio::test]
async fn test_concurrent_requests_share_bundle() {
    let (_dir, captioner, calls) = captioner(GenerationPolicy::default());

    let mut handles = Vec::new();
    for i in 0..6 {
        let captioner = captioner.clone();
        handles.push(tokio::spawn(async move {
            captioner
                .respond(upload(
                    &format!("img{i}.jpg"),
                    "image/jpeg",
                    common::jpeg_bytes(12, 12),
                ))
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_success());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 6);
}

#[test]
fn test_assembler_reports_missing_weights() {
    let dir = tempfile::tempdir().unwrap();
    let paths = common::write_tokenizer_artifacts(dir.path());
    std::fs::write(&paths.model_config, r#"{"model_type": "vision-encoder-decoder"}"#).unwrap();
    std::fs::write(&paths.feature_extractor_config, r#"{"size": 224}"#).unwrap();
    std::fs::write(&paths.generation_config, r#"{"max_length": 16}"#).unwrap();

    let err = ModelAssembler::new(ArtifactPaths::in_dir(dir.path()))
        .assemble()
        .err()
        .unwrap();
    match err {
        CaptionError::ModelInit { component, source } => {
            assert_eq!(component, Component::Model);
            match source {
                ArtifactError::Missing(path) => assert_eq!(path, paths.encoder_weights),
                other => panic!("unexpected source: {other}"),
            }
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_assembler_builds_json_components() {
    let dir = tempfile::tempdir().unwrap();
    let paths = common::write_tokenizer_artifacts(dir.path());
    std::fs::write(
        &paths.generation_config,
        r#"{"max_length": 16, "num_beams": 4, "transformers_version": "4.30.0"}"#,
    )
    .unwrap();
    let assembler = ModelAssembler::new(paths);

    let tokenizer = assembler.build_tokenizer().unwrap();
    assert_eq!(tokenizer.vocab_size(), common::VOCAB_SIZE);

    let policy = assembler.build_generation_policy().unwrap();
    assert_eq!(policy.max_length, 16);
    assert_eq!(policy.num_beams, 4);
}

#[test]
fn test_generation_config_rejects_unknown_fields() {
    let dir = tempfile::tempdir().unwrap();
    let paths = ArtifactPaths::in_dir(dir.path());
    std::fs::write(&paths.generation_config, r#"{"max_lenght": 16}"#).unwrap();

    let err = ModelAssembler::new(paths)
        .build_generation_policy()
        .unwrap_err();
    assert!(matches!(err, ArtifactError::Invalid { .. }));
}
