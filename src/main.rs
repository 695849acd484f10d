// CLI driver: run one extraction against the configured model endpoint
// and print the resulting FHIR bundle as JSON on stdout.
//
//   medbridge <image-path> [LAB_REPORT|RADIOLOGY_REPORT|PRESCRIPTION|VITALS]

use std::path::Path;
use std::process::ExitCode;

use medbridge::config::{ExtractionConfig, APP_VERSION};
use medbridge::models::DocumentType;
use medbridge::pipeline::{
    ClientConfig, ExtractionError, HttpVisionClient, ImageAttachment, Orchestrator, RunOutcome,
};

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("pdf") => "application/pdf",
        _ => "image/png",
    }
}

fn run() -> Result<ExitCode, ExtractionError> {
    let mut args = std::env::args().skip(1);
    let image_path = args.next().ok_or_else(|| {
        ExtractionError::Config("usage: medbridge <image-path> [document-type]".to_string())
    })?;
    let doc_type = args
        .next()
        .map(|hint| DocumentType::from_hint(&hint))
        .unwrap_or(DocumentType::LabReport);

    let path = Path::new(&image_path);
    let image = ImageAttachment {
        data: std::fs::read(path)?,
        mime: mime_for(path).to_string(),
    };

    let config = ExtractionConfig::from_env();
    let client = HttpVisionClient::new(ClientConfig::from_env()?)?;
    let orchestrator = Orchestrator::new(Box::new(client), config);

    tracing::info!(?doc_type, image = %image_path, "starting extraction run");
    let report = orchestrator.run(doc_type, Some(&image))?;

    for entry in &report.history {
        tracing::info!(
            attempt = entry.attempt,
            status = entry.status.as_str(),
            errors = entry.errors.len(),
            "attempt finished"
        );
    }

    match report.outcome {
        RunOutcome::Complete {
            bundle,
            bundle_defects,
            ..
        } => {
            for defect in &bundle_defects {
                tracing::error!(%defect, "post-build validation defect");
            }
            println!("{}", serde_json::to_string_pretty(&bundle.to_value())?);
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::Exhausted { defects } => {
            tracing::error!("failed to extract structured data within the retry limit");
            for defect in &defects {
                tracing::error!(%defect, "last attempt defect");
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    medbridge::init_tracing();
    tracing::info!("medbridge v{APP_VERSION}");

    match run() {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
