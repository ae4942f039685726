use std::path::Path;

use anyhow::{anyhow, Result};
use dendro_core::error::{JobError, ProcessorError};
use dendro_core::processors::{find_processor, VOLUSEG_APP, VOLUSEG_PROCESSOR};
use dendro_core::voluseg::{
    run_segmentation, Registration, SegmentationBackend, SegmentationStep, VolusegParams,
};
use serde_json::{json, Map, Value};

#[derive(Default)]
struct RecordingBackend {
    received: Option<Map<String, Value>>,
    steps: Vec<(SegmentationStep, Value)>,
    fail_at: Option<SegmentationStep>,
}

impl SegmentationBackend for RecordingBackend {
    fn process_parameters(&mut self, parameters: &Map<String, Value>) -> Result<Map<String, Value>> {
        self.received = Some(parameters.clone());
        let mut persisted = parameters.clone();
        persisted.insert("n_timepoints".to_string(), json!(120));
        Ok(persisted)
    }

    fn run_step(&mut self, step: SegmentationStep, parameters: &Map<String, Value>) -> Result<()> {
        if self.fail_at == Some(step) {
            return Err(anyhow!("no cells survived masking"));
        }
        self.steps.push((step, parameters["n_timepoints"].clone()));
        Ok(())
    }
}

#[test]
fn defaults_agree_with_the_registry() {
    let processor = find_processor(VOLUSEG_APP, VOLUSEG_PROCESSOR).expect("registered");
    let defaults = match serde_json::to_value(VolusegParams::default()).expect("serializes") {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    };

    assert_eq!(defaults.len(), processor.parameters.len());
    for spec in &processor.parameters {
        let ours = &defaults[spec.name];
        match (ours.as_f64(), spec.default.as_f64()) {
            (Some(a), Some(b)) => assert_eq!(a, b, "{}", spec.name),
            _ => assert_eq!(ours, &spec.default, "{}", spec.name),
        }
    }
}

#[test]
fn parameter_dictionary_carries_paths_and_user_values() -> Result<()> {
    let params = VolusegParams {
        registration: Registration::High,
        diam_cell: 5.0,
        ..VolusegParams::default()
    };

    let dictionary = params.parameter_dictionary(
        "https://dandiarchive.s3.amazonaws.com/blobs/057/ecb/057ecbef",
        "/ants-2.5.3/bin/",
        Path::new("/tmp/voluseg_output"),
    )?;

    assert_eq!(dictionary["dir_ants"], json!("/ants-2.5.3/bin/"));
    assert_eq!(
        dictionary["dir_input"],
        json!("https://dandiarchive.s3.amazonaws.com/blobs/057/ecb/057ecbef")
    );
    assert_eq!(dictionary["dir_output"], json!("/tmp/voluseg_output"));
    assert_eq!(dictionary["registration"], json!("high"));
    assert_eq!(dictionary["diam_cell"], json!(5.0));
    assert_eq!(dictionary["type_timepoints"], json!("dff"));
    Ok(())
}

#[test]
fn steps_run_in_order_with_persisted_parameters() -> Result<()> {
    let mut backend = RecordingBackend::default();

    let report = run_segmentation(
        &mut backend,
        &VolusegParams::default(),
        "file:///data/session.nwb",
        "/ants/bin/",
        Path::new("/tmp/out"),
    )?;

    let received = backend.received.as_ref().expect("step 0 ran");
    assert_eq!(received["dir_input"], json!("file:///data/session.nwb"));
    assert_eq!(
        backend.steps.iter().map(|(step, _)| *step).collect::<Vec<_>>(),
        SegmentationStep::ALL.to_vec()
    );
    assert!(backend.steps.iter().all(|(_, n)| n == &json!(120)));
    assert_eq!(
        report.completed_steps,
        vec![
            "step1_process_volumes",
            "step2_align_volumes",
            "step3_mask_volumes",
            "step4_detect_cells",
            "step5_clean_cells",
        ]
    );
    assert_eq!(report.parameters["n_timepoints"], json!(120));
    Ok(())
}

#[test]
fn failing_step_stops_the_pipeline() {
    let mut backend = RecordingBackend {
        fail_at: Some(SegmentationStep::MaskVolumes),
        ..RecordingBackend::default()
    };

    let err = run_segmentation(
        &mut backend,
        &VolusegParams::default(),
        "file:///data/session.nwb",
        "/ants/bin/",
        Path::new("/tmp/out"),
    )
    .unwrap_err();

    match err {
        ProcessorError::Segmentation { step, message } => {
            assert_eq!(step, "step3_mask_volumes");
            assert!(message.contains("no cells survived masking"));
        }
        other => panic!("expected segmentation error, got {other}"),
    }
    assert_eq!(backend.steps.len(), 2);
}

#[test]
fn out_of_range_values_are_rejected() {
    let params = VolusegParams {
        ds: 0,
        ..VolusegParams::default()
    };
    assert!(matches!(
        params.validate(),
        Err(JobError::ParameterRange { name, .. }) if name == "ds"
    ));

    let params = VolusegParams {
        res_z: -5.0,
        ..VolusegParams::default()
    };
    assert!(matches!(
        params.validate(),
        Err(JobError::ParameterRange { name, .. }) if name == "res_z"
    ));

    let params = VolusegParams {
        dim_order: "xxz".to_string(),
        ..VolusegParams::default()
    };
    assert!(params.validate().is_err());

    let mut backend = RecordingBackend::default();
    let result = run_segmentation(
        &mut backend,
        &params,
        "file:///data/session.nwb",
        "/ants/bin/",
        Path::new("/tmp/out"),
    );
    assert!(matches!(result, Err(ProcessorError::Job(_))));
    assert!(backend.received.is_none());
}

#[test]
fn params_parse_from_resolved_parameters() -> Result<()> {
    let processor = find_processor(VOLUSEG_APP, VOLUSEG_PROCESSOR)?;
    let registration = json!("low");
    let timepoints = json!(250);
    let resolved = processor.resolve_parameters([
        ("registration", &registration),
        ("timepoints", &timepoints),
    ])?;

    let params = VolusegParams::from_parameters(&resolved)?;

    assert_eq!(params.registration, Registration::Low);
    assert_eq!(params.timepoints, 250);
    assert_eq!(params.diam_cell, 6.0);
    Ok(())
}
