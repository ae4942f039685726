use anyhow::Result;
use dendro_core::config::Settings;
use dendro_core::error::JobError;
use dendro_core::jobs::{
    JobClient, JobDefinition, JobRequiredResources, JobStatus, JobSubmission, SpoolJobClient,
};
use serde_json::{json, Value};

fn photon_flux_definition() -> JobDefinition {
    JobDefinition::new("photon_flux", "photon_flux_processor")
        .with_input(
            "input",
            "sub-17797_ses-4-scan-10_behavior+image+ophys.nwb",
            "https://dandiarchive.s3.amazonaws.com/blobs/a65/6b4/a656b41f-99f7-49e0-a13e-1b283b97a002",
        )
        .with_output("output", "photon_flux.json")
        .with_parameter("series_path", json!("acquisition/TwoPhotonSeries1"))
        .with_parameter("subset_frames", json!((0..500).collect::<Vec<u32>>()))
        .with_parameter("crop_edges", json!([4, 4, 4, 4]))
}

fn submission(job_definition: JobDefinition) -> JobSubmission {
    JobSubmission {
        service_name: "photon_flux".to_string(),
        job_definition,
        required_resources: JobRequiredResources {
            num_cpus: 2,
            num_gpus: 0,
            memory_gb: 4.0,
            time_sec: 3600.0,
        },
        target_compute_client_ids: vec!["IcUxwh0z6edS".to_string()],
        tags: vec!["example".to_string()],
        skip_cache: true,
    }
}

#[test]
fn definitions_use_camel_case_on_the_wire() -> Result<()> {
    let value = serde_json::to_value(submission(photon_flux_definition()))?;

    assert_eq!(value["service_name"], json!("photon_flux"));
    assert_eq!(value["job_definition"]["appName"], json!("photon_flux"));
    assert_eq!(value["job_definition"]["processorName"], json!("photon_flux_processor"));
    assert_eq!(
        value["job_definition"]["outputFiles"][0]["fileBaseName"],
        json!("photon_flux.json")
    );
    assert_eq!(value["required_resources"]["numCpus"], json!(2));
    assert_eq!(value["required_resources"]["memoryGb"], json!(4.0));
    assert_eq!(value["job_definition"]["parameters"][2]["name"], json!("crop_edges"));
    Ok(())
}

#[test]
fn spool_client_persists_valid_submissions() -> Result<()> {
    let spool = tempfile::tempdir()?;
    let client = SpoolJobClient::new(spool.path(), "https://dendro.vercel.app/");
    let submission = submission(photon_flux_definition());

    let handle = client.submit(&submission)?;

    assert_eq!(handle.status, JobStatus::Pending);
    assert_eq!(
        handle.job_url,
        format!("https://dendro.vercel.app/job/{}", handle.job_id)
    );
    let spooled = client.read_job(handle.job_id)?;
    assert_eq!(spooled.handle, handle);
    assert_eq!(spooled.submission, submission);
    Ok(())
}

#[test]
fn resolved_parameters_fill_defaults() -> Result<()> {
    let definition = JobDefinition::new("voluseg", "voluseg_processor")
        .with_parameter("registration", json!("high"))
        .with_parameter("diam_cell", json!(5.0));

    let parameters = definition.resolved_parameters()?;

    assert_eq!(parameters["registration"], json!("high"));
    assert_eq!(parameters["diam_cell"], json!(5.0));
    assert_eq!(parameters["timepoints"], json!(1000));
    assert_eq!(parameters["type_mask"], json!("geomean"));
    Ok(())
}

#[test]
fn invalid_definitions_are_rejected() {
    let unknown_app = JobDefinition::new("spike_sorting", "kilosort");
    assert!(matches!(unknown_app.validate(), Err(JobError::UnknownApp(_))));

    let unknown_processor = JobDefinition::new("voluseg", "photon_flux_processor");
    assert!(matches!(
        unknown_processor.validate(),
        Err(JobError::UnknownProcessor { .. })
    ));

    let bad_option = photon_flux_definition();
    let bad_option = JobDefinition {
        app_name: "voluseg".to_string(),
        processor_name: "voluseg_processor".to_string(),
        parameters: Vec::new(),
        ..bad_option
    }
    .with_parameter("registration", json!("extreme"));
    match bad_option.validate() {
        Err(JobError::ParameterOption { name, options, .. }) => {
            assert_eq!(name, "registration");
            assert_eq!(options, vec!["high", "medium", "low", "none"]);
        }
        other => panic!("expected option error, got {other:?}"),
    }

    let wrong_type = photon_flux_definition().with_parameter("process_all_series", json!("yes"));
    assert!(matches!(
        wrong_type.validate(),
        Err(JobError::ParameterType { expected: "a boolean", .. })
    ));

    let unknown_parameter = photon_flux_definition().with_parameter("gain", json!(1.0));
    assert!(matches!(
        unknown_parameter.validate(),
        Err(JobError::UnknownParameter { .. })
    ));

    let duplicate = photon_flux_definition().with_parameter("crop_edges", json!([0, 0, 0, 0]));
    assert!(matches!(
        duplicate.validate(),
        Err(JobError::DuplicateParameter(name)) if name == "crop_edges"
    ));
    assert_eq!(
        JobError::DuplicateParameter("crop_edges".to_string()).to_string(),
        "parameter 'crop_edges' is given more than once"
    );

    let short_crop = JobDefinition {
        parameters: Vec::new(),
        ..photon_flux_definition()
    }
    .with_parameter("crop_edges", json!([4, 4, 4]));
    assert!(matches!(short_crop.validate(), Err(JobError::Json(_))));

    let negative_frames = JobDefinition {
        parameters: Vec::new(),
        ..photon_flux_definition()
    }
    .with_parameter("subset_frames", json!([0, -1]));
    assert!(matches!(
        negative_frames.validate(),
        Err(JobError::ParameterType { .. })
    ));
}

#[test]
fn file_declarations_are_checked() {
    let missing_output = JobDefinition {
        output_files: Vec::new(),
        ..photon_flux_definition()
    };
    assert!(matches!(
        missing_output.validate(),
        Err(JobError::MissingFile { kind: "output", .. })
    ));

    let duplicate_input = photon_flux_definition().with_input("input", "other.nwb", "https://example.org/b");
    assert!(matches!(
        duplicate_input.validate(),
        Err(JobError::DuplicateFile { kind: "input", .. })
    ));

    let undeclared = photon_flux_definition().with_output("report", "report.html");
    assert!(matches!(
        undeclared.validate(),
        Err(JobError::UndeclaredFile { .. })
    ));

    let empty_url = JobDefinition {
        input_files: Vec::new(),
        ..photon_flux_definition()
    }
    .with_input("input", "session.nwb", " ");
    assert!(matches!(
        empty_url.validate(),
        Err(JobError::EmptyFileField { field: "url", .. })
    ));
}

#[test]
fn submissions_need_a_service_and_resources() {
    let spool = tempfile::tempdir().expect("tempdir");
    let client = SpoolJobClient::new(spool.path(), "https://dendro.vercel.app");

    let mut nameless = submission(photon_flux_definition());
    nameless.service_name = "  ".to_string();
    assert!(matches!(client.submit(&nameless), Err(JobError::MissingServiceName)));

    let mut no_cpus = submission(photon_flux_definition());
    no_cpus.required_resources.num_cpus = 0;
    assert!(matches!(client.submit(&no_cpus), Err(JobError::Resources(_))));

    let mut no_time = submission(photon_flux_definition());
    no_time.required_resources.time_sec = 0.0;
    assert!(matches!(no_time.validate(), Err(JobError::Resources(_))));

    let written = std::fs::read_dir(spool.path())
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(written, 0);
}

#[test]
fn submissions_parse_from_json() -> Result<()> {
    let text = json!({
        "service_name": "luiz-dandihub-service",
        "job_definition": {
            "appName": "voluseg",
            "processorName": "voluseg_processor",
            "inputFiles": [{
                "name": "input",
                "fileBaseName": "sub-20161022-1",
                "url": "https://dandiarchive.s3.amazonaws.com/blobs/057/ecb/057ecbef-e732-4e94-8d99-40ebb74d346e"
            }],
            "outputFiles": [{"name": "output", "fileBaseName": "cells0_clean.nwb"}],
            "parameters": [
                {"name": "registration", "value": "high"},
                {"name": "diam_cell", "value": 5.0},
                {"name": "f_volume", "value": 2.0},
                {"name": "timepoints", "value": 1000}
            ]
        },
        "required_resources": {"numCpus": 24, "numGpus": 0, "memoryGb": 120, "timeSec": 21600}
    })
    .to_string();

    let submission: JobSubmission = serde_json::from_str(&text)?;
    assert!(submission.target_compute_client_ids.is_empty());
    assert!(!submission.skip_cache);
    let processor = submission.validate()?;
    assert_eq!(processor.name, "voluseg_processor");
    assert_eq!(submission.required_resources.memory_gb, 120.0);

    let round_trip: Value = serde_json::to_value(&submission)?;
    assert_eq!(round_trip["job_definition"]["parameters"][3]["value"], json!(1000));
    Ok(())
}

#[test]
fn unconfigured_service_name_blocks_submission() {
    let settings = Settings::default();
    assert!(settings.service_name.is_empty());

    let mut unconfigured = submission(photon_flux_definition());
    unconfigured.service_name = settings.service_name.clone();
    assert!(matches!(
        unconfigured.validate(),
        Err(JobError::MissingServiceName)
    ));
}
