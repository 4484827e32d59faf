use std::path::{Path, PathBuf};
use std::process::Command;

use sign_protocol::SigningJobSpec;

/// Default external signing tool, overridable per job.
const DEFAULT_SIGNING_COMMAND: &str = "pdf-sign";

/// Environment variable the signing tool reads the passphrase/PIN from.
/// Passing it through the environment keeps the secret off the command line.
const PASSWORD_ENV: &str = "SIGNING_PASSWORD";

/// Well-known PKCS#11 module locations, probed in order when the job does
/// not pin one explicitly.
const PKCS11_CANDIDATES: &[&str] = &[
    "/usr/lib/x86_64-linux-gnu/opensc-pkcs11.so",
    "/usr/lib/opensc-pkcs11.so",
    "/usr/local/lib/opensc-pkcs11.so",
    "C:\\Windows\\System32\\opensc-pkcs11.dll",
];

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("PKCS#11 error: {0}")]
    Pkcs11(String),
    #[error("signing command failed: {0}")]
    Command(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Narrow capability the worker needs from a signing backend: sign one
/// document, and release whatever the backend holds when done.
///
/// The backend is opened once per run. Setup failures (bad certificate,
/// missing PKCS#11 module) must surface at open time, not per document.
pub trait PdfSigner {
    fn sign(&mut self, pdf: &[u8]) -> Result<Vec<u8>, SignerError>;
    fn close(&mut self) -> Result<(), SignerError>;
}

/// Opens the signing backend described by the job.
///
/// File-certificate jobs require an existing PKCS#12 bundle; hardware-token
/// jobs require a resolvable PKCS#11 module. Both checks fail fast here so
/// a misconfigured job dies before the first document is touched.
pub fn open_backend(
    job: &SigningJobSpec,
    work_dir: &Path,
) -> Result<Box<dyn PdfSigner>, SignerError> {
    let command = job
        .signing_command
        .clone()
        .unwrap_or_else(|| DEFAULT_SIGNING_COMMAND.to_string());

    let mode = if job.use_hardware_token {
        let module = resolve_pkcs11_module(job.pkcs11_module.as_deref())?;
        tracing::info!(module = %module.display(), "using PKCS#11 hardware token");
        SignerMode::HardwareToken { module }
    } else {
        let path = job
            .certificate_path
            .as_deref()
            .ok_or_else(|| SignerError::Certificate("no certificate path configured".into()))?;
        let path = PathBuf::from(path);
        if !path.is_file() {
            return Err(SignerError::Certificate(format!(
                "certificate not found: {}",
                path.display()
            )));
        }
        SignerMode::Certificate { path }
    };

    Ok(Box::new(CommandSigner {
        command,
        password: job.certificate_password.clone(),
        mode,
        scratch_in: work_dir.join("scratch_in.pdf"),
        scratch_out: work_dir.join("scratch_out.pdf"),
    }))
}

fn resolve_pkcs11_module(configured: Option<&str>) -> Result<PathBuf, SignerError> {
    if let Some(path) = configured {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
        return Err(SignerError::Pkcs11(format!(
            "configured PKCS#11 module not found: {}",
            path.display()
        )));
    }

    if let Ok(path) = std::env::var("PKCS11_MODULE") {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
    }

    for candidate in PKCS11_CANDIDATES {
        let path = PathBuf::from(candidate);
        if path.is_file() {
            return Ok(path);
        }
    }

    Err(SignerError::Pkcs11(
        "no PKCS#11 module found; set PKCS11_MODULE or install OpenSC".into(),
    ))
}

enum SignerMode {
    Certificate { path: PathBuf },
    HardwareToken { module: PathBuf },
}

/// Signing backend that delegates each document to an external signing
/// tool, keeping all cryptography outside this process. The tool is invoked
/// per document with an input and output path; the passphrase travels via
/// the environment.
pub struct CommandSigner {
    command: String,
    password: String,
    mode: SignerMode,
    scratch_in: PathBuf,
    scratch_out: PathBuf,
}

impl PdfSigner for CommandSigner {
    fn sign(&mut self, pdf: &[u8]) -> Result<Vec<u8>, SignerError> {
        std::fs::write(&self.scratch_in, pdf)?;
        // Stale output from a previous document must not be mistaken for a
        // fresh signature.
        let _ = std::fs::remove_file(&self.scratch_out);

        let mut cmd = Command::new(&self.command);
        cmd.arg("--in")
            .arg(&self.scratch_in)
            .arg("--out")
            .arg(&self.scratch_out)
            .env(PASSWORD_ENV, &self.password);

        match &self.mode {
            SignerMode::Certificate { path } => {
                cmd.arg("--p12").arg(path);
            }
            SignerMode::HardwareToken { module } => {
                cmd.arg("--pkcs11-module").arg(module);
            }
        }

        let output = cmd
            .output()
            .map_err(|e| SignerError::Command(format!("{}: {e}", self.command)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SignerError::Command(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        if !self.scratch_out.is_file() {
            return Err(SignerError::Command(format!(
                "{} produced no output file",
                self.command
            )));
        }

        Ok(std::fs::read(&self.scratch_out)?)
    }

    fn close(&mut self) -> Result<(), SignerError> {
        let _ = std::fs::remove_file(&self.scratch_in);
        let _ = std::fs::remove_file(&self.scratch_out);
        Ok(())
    }
}
