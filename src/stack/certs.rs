//! TLS material of the stack.
//!
//! The profile keeps one self-signed CA under `certs/` and one certificate
//! per service under `certs/<service>/`. Existing files are reused for as
//! long as they verify against the current CA, so repeated boots do not
//! churn certificates that containers have already loaded.

use super::{CA_CERT_FILE, CA_ENV_FILE, CA_KEY_FILE, CERTS_DIR};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";
const SERVICE_CA_FILE: &str = "ca-cert.pem";

const CA_VALIDITY_DAYS: u32 = 3650;
const LEAF_VALIDITY_DAYS: u32 = 800;
const OPENSSL_TIMEOUT: Duration = Duration::from_secs(60);

/// One certificate a stack topology needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsService {
    pub name: &'static str,
    /// Client certificates are issued for `clientAuth` and are not bound to
    /// a host name.
    pub client: bool,
}

impl TlsService {
    pub const fn server(name: &'static str) -> Self {
        TlsService { name, client: false }
    }

    pub const fn client(name: &'static str) -> Self {
        TlsService { name, client: true }
    }
}

/// Services of the local compose stack.
pub const COMPOSE_TLS_SERVICES: &[TlsService] = &[
    TlsService::server("elasticsearch"),
    TlsService::server("kibana"),
    TlsService::server("package-registry"),
    TlsService::server("fleet-server"),
    TlsService::server("logstash"),
];

/// Agent certificate, needed when agents ship to Logstash.
pub const AGENT_CLIENT_TLS_SERVICE: TlsService = TlsService::client("elastic-agent");

/// Services started locally next to an adopted or remote stack.
pub const LOCAL_TLS_SERVICES: &[TlsService] = &[
    AGENT_CLIENT_TLS_SERVICE,
    TlsService::server("fleet-server"),
    TlsService::server("logstash"),
];

/// Services started next to a cloud or serverless stack.
pub const REMOTE_AGENT_TLS_SERVICES: &[TlsService] = &[
    AGENT_CLIENT_TLS_SERVICE,
    TlsService::server("logstash"),
];

/// Issues and checks certificates.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Writes a new self-signed CA.
    async fn create_ca(&self, cert: &Path, key: &Path) -> Result<()>;

    /// Checks that `cert` chains to `ca_cert`, has not expired and, when
    /// `host` is given, is valid for it.
    async fn verify(&self, ca_cert: &Path, cert: &Path, host: Option<&str>) -> Result<()>;

    /// Issues a certificate for `service` signed by the CA.
    async fn issue(
        &self,
        ca_cert: &Path,
        ca_key: &Path,
        service: &TlsService,
        cert: &Path,
        key: &Path,
    ) -> Result<()>;

    /// Upper-case hex SHA-256 of the certificate's DER encoding.
    async fn fingerprint(&self, cert: &Path) -> Result<String>;
}

/// What [`ensure_certificates`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateReport {
    pub ca_created: bool,
    pub issued: Vec<String>,
}

/// Makes sure the profile has a valid CA and a valid certificate for every
/// service in `services`.
pub async fn ensure_certificates(
    authority: &dyn CertificateAuthority,
    profile_root: &Path,
    services: &[TlsService],
) -> Result<CertificateReport> {
    let certs_dir = profile_root.join(CERTS_DIR);
    std::fs::create_dir_all(&certs_dir)?;
    let ca_cert = profile_root.join(CA_CERT_FILE);
    let ca_key = profile_root.join(CA_KEY_FILE);

    let mut report = CertificateReport::default();
    let ca_valid = ca_key.is_file() && authority.verify(&ca_cert, &ca_cert, None).await.is_ok();
    if !ca_valid {
        tracing::info!(path = %ca_cert.display(), "creating certificate authority");
        authority.create_ca(&ca_cert, &ca_key).await?;
        report.ca_created = true;
    }

    let fingerprint = authority.fingerprint(&ca_cert).await?;
    write_if_changed(
        &profile_root.join(CA_ENV_FILE),
        format!(
            "ELASTIC_PACKAGE_CA_CERT={}\nELASTIC_PACKAGE_CA_TRUSTED_FINGERPRINT={}\n",
            ca_cert.display(),
            fingerprint
        )
        .as_bytes(),
    )?;
    let ca_pem = std::fs::read(&ca_cert)?;

    for service in services {
        let (cert, key) = service_cert_paths(profile_root, service.name);
        let dir = certs_dir.join(service.name);
        std::fs::create_dir_all(&dir)?;

        let host = (!service.client).then_some(service.name);
        let reusable = !report.ca_created
            && key.is_file()
            && authority.verify(&ca_cert, &cert, host).await.is_ok();
        if !reusable {
            tracing::debug!(service = service.name, "issuing certificate");
            authority.issue(&ca_cert, &ca_key, service, &cert, &key).await?;
            report.issued.push(service.name.to_string());
        }

        // Services mount only their own directory, so they get a CA copy.
        write_if_changed(&dir.join(SERVICE_CA_FILE), &ca_pem)?;
    }

    Ok(report)
}

/// Paths of a service's certificate and key.
pub fn service_cert_paths(profile_root: &Path, service: &str) -> (PathBuf, PathBuf) {
    let dir = profile_root.join(CERTS_DIR).join(service);
    (dir.join(CERT_FILE), dir.join(KEY_FILE))
}

fn write_if_changed(path: &Path, contents: &[u8]) -> Result<()> {
    match std::fs::read(path) {
        Ok(current) if current == contents => Ok(()),
        _ => Ok(std::fs::write(path, contents)?),
    }
}

/// [`CertificateAuthority`] driving the `openssl` CLI.
#[derive(Debug, Clone)]
pub struct OpensslAuthority {
    program: String,
}

impl Default for OpensslAuthority {
    fn default() -> Self {
        OpensslAuthority {
            program: "openssl".to_string(),
        }
    }
}

impl OpensslAuthority {
    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        let display = format!("{} {}", self.program, args.join(" "));
        let output = tokio::time::timeout(
            OPENSSL_TIMEOUT,
            tokio::process::Command::new(&self.program)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Certificate(format!("'{}' timed out", display)))?
        .map_err(|e| Error::Certificate(format!("failed to run '{}': {}", display, e)))?;
        Ok(output)
    }

    async fn run_success(&self, args: &[&str]) -> Result<std::process::Output> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(Error::Certificate(format!(
                "'{} {}' failed: {}",
                self.program,
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::Certificate(format!("non UTF-8 path {}", path.display())))
}

/// X.509 v3 extensions of a leaf certificate.
fn leaf_extensions(service: &TlsService) -> String {
    let usage = if service.client { "clientAuth" } else { "serverAuth" };
    format!(
        "basicConstraints=CA:FALSE\n\
         keyUsage=critical,digitalSignature,keyEncipherment\n\
         extendedKeyUsage={}\n\
         subjectAltName=DNS:{},DNS:localhost,IP:127.0.0.1,IP:::1\n",
        usage, service.name
    )
}

/// `sha256 Fingerprint=AB:CD:...` to `ABCD...`.
fn parse_fingerprint(output: &str) -> Option<String> {
    let (_, hex) = output.trim().split_once('=')?;
    let hex: String = hex.chars().filter(|c| *c != ':').collect();
    (!hex.is_empty()).then(|| hex.to_uppercase())
}

fn serial_number() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("0x{:x}", nanos)
}

#[async_trait]
impl CertificateAuthority for OpensslAuthority {
    async fn create_ca(&self, cert: &Path, key: &Path) -> Result<()> {
        let days = CA_VALIDITY_DAYS.to_string();
        self.run_success(&[
            "req",
            "-x509",
            "-newkey",
            "rsa:2048",
            "-nodes",
            "-sha256",
            "-days",
            &days,
            "-subj",
            "/O=elastic-package/CN=elastic-package CA",
            "-addext",
            "basicConstraints=critical,CA:TRUE",
            "-addext",
            "keyUsage=critical,keyCertSign,cRLSign,digitalSignature",
            "-keyout",
            path_str(key)?,
            "-out",
            path_str(cert)?,
        ])
        .await?;
        Ok(())
    }

    async fn verify(&self, ca_cert: &Path, cert: &Path, host: Option<&str>) -> Result<()> {
        if !cert.is_file() || !ca_cert.is_file() {
            return Err(Error::Certificate(format!("{} does not exist", cert.display())));
        }
        self.run_success(&["verify", "-CAfile", path_str(ca_cert)?, path_str(cert)?])
            .await?;
        if let Some(host) = host {
            let output = self
                .run_success(&["x509", "-noout", "-in", path_str(cert)?, "-checkhost", host])
                .await?;
            let text = String::from_utf8_lossy(&output.stdout);
            if !text.contains("does match") {
                return Err(Error::Certificate(format!(
                    "{} is not valid for {}",
                    cert.display(),
                    host
                )));
            }
        }
        Ok(())
    }

    async fn issue(
        &self,
        ca_cert: &Path,
        ca_key: &Path,
        service: &TlsService,
        cert: &Path,
        key: &Path,
    ) -> Result<()> {
        let work = cert
            .parent()
            .ok_or_else(|| Error::Certificate(format!("{} has no parent", cert.display())))?;
        let csr = work.join("request.csr");
        let extensions = work.join("extensions.cnf");
        std::fs::write(&extensions, leaf_extensions(service))?;

        let subject = format!("/O=elastic-package/CN={}", service.name);
        self.run_success(&[
            "req",
            "-new",
            "-newkey",
            "rsa:2048",
            "-nodes",
            "-subj",
            &subject,
            "-keyout",
            path_str(key)?,
            "-out",
            path_str(&csr)?,
        ])
        .await?;

        let days = LEAF_VALIDITY_DAYS.to_string();
        let serial = serial_number();
        let signed = self
            .run_success(&[
                "x509",
                "-req",
                "-sha256",
                "-in",
                path_str(&csr)?,
                "-CA",
                path_str(ca_cert)?,
                "-CAkey",
                path_str(ca_key)?,
                "-set_serial",
                &serial,
                "-days",
                &days,
                "-extfile",
                path_str(&extensions)?,
                "-out",
                path_str(cert)?,
            ])
            .await;
        let _ = std::fs::remove_file(&csr);
        let _ = std::fs::remove_file(&extensions);
        signed.map(|_| ())
    }

    async fn fingerprint(&self, cert: &Path) -> Result<String> {
        let output = self
            .run_success(&["x509", "-noout", "-fingerprint", "-sha256", "-in", path_str(cert)?])
            .await?;
        parse_fingerprint(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            Error::Certificate(format!("could not read fingerprint of {}", cert.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Writes marker files and treats any existing file as valid.
    #[derive(Default)]
    struct FakeAuthority {
        issued: Mutex<Vec<String>>,
        invalid: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl CertificateAuthority for FakeAuthority {
        async fn create_ca(&self, cert: &Path, key: &Path) -> Result<()> {
            std::fs::write(cert, "CA")?;
            std::fs::write(key, "CA KEY")?;
            Ok(())
        }

        async fn verify(&self, _ca: &Path, cert: &Path, _host: Option<&str>) -> Result<()> {
            if cert.is_file() && !self.invalid.lock().contains(&cert.to_path_buf()) {
                Ok(())
            } else {
                Err(Error::Certificate("invalid".to_string()))
            }
        }

        async fn issue(
            &self,
            _ca: &Path,
            _ca_key: &Path,
            service: &TlsService,
            cert: &Path,
            key: &Path,
        ) -> Result<()> {
            std::fs::write(cert, service.name)?;
            std::fs::write(key, "KEY")?;
            self.issued.lock().push(service.name.to_string());
            Ok(())
        }

        async fn fingerprint(&self, _cert: &Path) -> Result<String> {
            Ok("ABCDEF".to_string())
        }
    }

    #[tokio::test]
    async fn creates_everything_once() {
        let dir = tempfile::tempdir().unwrap();
        let authority = FakeAuthority::default();

        let first = ensure_certificates(&authority, dir.path(), COMPOSE_TLS_SERVICES)
            .await
            .unwrap();
        assert!(first.ca_created);
        assert_eq!(first.issued.len(), 5);
        assert!(dir.path().join("certs/kibana/ca-cert.pem").is_file());
        let env = std::fs::read_to_string(dir.path().join("certs/ca.env")).unwrap();
        assert!(env.contains("ELASTIC_PACKAGE_CA_TRUSTED_FINGERPRINT=ABCDEF"));

        let second = ensure_certificates(&authority, dir.path(), COMPOSE_TLS_SERVICES)
            .await
            .unwrap();
        assert_eq!(second, CertificateReport::default());
    }

    #[tokio::test]
    async fn reissues_only_invalid_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let authority = FakeAuthority::default();
        ensure_certificates(&authority, dir.path(), LOCAL_TLS_SERVICES)
            .await
            .unwrap();

        authority
            .invalid
            .lock()
            .push(dir.path().join("certs/fleet-server/cert.pem"));
        let report = ensure_certificates(&authority, dir.path(), LOCAL_TLS_SERVICES)
            .await
            .unwrap();
        assert!(!report.ca_created);
        assert_eq!(report.issued, vec!["fleet-server".to_string()]);
    }

    #[tokio::test]
    async fn new_ca_reissues_all_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let authority = FakeAuthority::default();
        ensure_certificates(&authority, dir.path(), REMOTE_AGENT_TLS_SERVICES)
            .await
            .unwrap();

        std::fs::remove_file(dir.path().join(CA_KEY_FILE)).unwrap();
        let report = ensure_certificates(&authority, dir.path(), REMOTE_AGENT_TLS_SERVICES)
            .await
            .unwrap();
        assert!(report.ca_created);
        assert_eq!(report.issued, vec!["elastic-agent", "logstash"]);
    }

    #[test]
    fn fingerprint_formats() {
        assert_eq!(
            parse_fingerprint("sha256 Fingerprint=ab:CD:01\n").as_deref(),
            Some("ABCD01")
        );
        assert_eq!(
            parse_fingerprint("SHA256 Fingerprint=AB:CD").as_deref(),
            Some("ABCD")
        );
        assert_eq!(parse_fingerprint("garbage"), None);
    }

    #[test]
    fn leaf_extensions_by_usage() {
        let server = leaf_extensions(&TlsService::server("kibana"));
        assert!(server.contains("extendedKeyUsage=serverAuth"));
        assert!(server.contains("DNS:kibana,DNS:localhost,IP:127.0.0.1,IP:::1"));
        assert!(leaf_extensions(&AGENT_CLIENT_TLS_SERVICE).contains("clientAuth"));
    }
}
