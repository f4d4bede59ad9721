//! Certificate management commands.

use anyhow::{anyhow, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::config::SubjectSettings;
use crate::tls::CertificateAuthority;

#[derive(Debug, Subcommand)]
pub enum CertCommand {
    /// Issue a new interception identity
    Generate(GenerateArgs),

    /// Report whether an identity exists and when it was issued
    Status(StatusArgs),
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    /// Output path for the certificate
    #[arg(long, default_value = "certs/proxy-cert.pem")]
    pub cert_path: PathBuf,

    /// Output path for the private key
    #[arg(long, default_value = "certs/proxy-key.pem")]
    pub key_path: PathBuf,

    /// Common name stamped into the certificate
    #[arg(long, default_value = "intercept-proxy.local")]
    pub common_name: String,

    /// Organization stamped into the certificate
    #[arg(long, default_value = "Intercept Proxy")]
    pub organization: String,

    /// Validity period in days
    #[arg(long, default_value_t = 365)]
    pub validity_days: u32,

    /// Overwrite an existing identity
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Path of the certificate to inspect
    #[arg(long, default_value = "certs/proxy-cert.pem")]
    pub cert_path: PathBuf,

    /// Path of the matching private key
    #[arg(long, default_value = "certs/proxy-key.pem")]
    pub key_path: PathBuf,
}

impl CertCommand {
    pub async fn execute(&self) -> Result<()> {
        match self {
            CertCommand::Generate(args) => generate(args).await,
            CertCommand::Status(args) => status(args).await,
        }
    }
}

async fn generate(args: &GenerateArgs) -> Result<()> {
    if !args.force && (args.cert_path.exists() || args.key_path.exists()) {
        return Err(anyhow!(
            "identity already exists at {} / {}; use --force to replace it",
            args.cert_path.display(),
            args.key_path.display()
        ));
    }

    let subject = SubjectSettings {
        common_name: args.common_name.clone(),
        organization: args.organization.clone(),
        ..SubjectSettings::default()
    };
    let authority = CertificateAuthority::new(
        &args.cert_path,
        &args.key_path,
        subject,
        args.validity_days,
    );
    authority.issue().await?;

    info!("✅ Identity written");
    info!("   Certificate: {}", args.cert_path.display());
    info!("   Private key: {}", args.key_path.display());
    Ok(())
}

async fn status(args: &StatusArgs) -> Result<()> {
    let authority = CertificateAuthority::new(
        &args.cert_path,
        &args.key_path,
        SubjectSettings::default(),
        1,
    );
    let status = authority.status().await?;

    if status.present {
        info!("📜 Identity present at {}", args.cert_path.display());
        match status.created_at {
            Some(created) => info!("   Issued: {}", created.to_rfc3339()),
            None => info!("   Issued: unknown"),
        }
        if let Some(subject) = status.subject {
            info!("   Subject: {}", subject);
        }
    } else {
        info!("📭 No identity at {}", args.cert_path.display());
        info!("   Run `cert generate` or let the server auto-generate one");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn args_in(dir: &std::path::Path) -> GenerateArgs {
        GenerateArgs {
            cert_path: dir.join("test.crt"),
            key_path: dir.join("test.key"),
            common_name: "test.local".to_string(),
            organization: "Test Org".to_string(),
            validity_days: 30,
            force: false,
        }
    }

    #[tokio::test]
    async fn generate_writes_a_fresh_pair() {
        let dir = tempdir().unwrap();
        let args = args_in(dir.path());

        generate(&args).await.unwrap();

        assert!(args.cert_path.exists());
        assert!(args.key_path.exists());
    }

    #[tokio::test]
    async fn generate_refuses_to_overwrite_without_force() {
        let dir = tempdir().unwrap();
        let mut args = args_in(dir.path());

        generate(&args).await.unwrap();
        let err = generate(&args).await.unwrap_err();
        assert!(err.to_string().contains("--force"));

        args.force = true;
        generate(&args).await.unwrap();
    }

    #[tokio::test]
    async fn status_reports_absent_then_present() {
        let dir = tempdir().unwrap();
        let args = args_in(dir.path());
        let status_args = StatusArgs {
            cert_path: args.cert_path.clone(),
            key_path: args.key_path.clone(),
        };

        status(&status_args).await.unwrap();
        generate(&args).await.unwrap();
        status(&status_args).await.unwrap();
    }
}
