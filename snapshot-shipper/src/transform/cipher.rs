//! Shard encryption.
//!
//! The cipher is opaque to the pipelines: bytes in, bytes out. The shipped
//! implementation drives an external program (`age` by default) over pipes,
//! feeding stdin and draining stdout concurrently so neither side blocks.

use super::compression::{BoxedReader, BoxedWriter};
use crate::config::EncryptionConfig;
use crate::transfer::is_upstream;
use crate::utils::{PipelineError, Result};
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

#[async_trait]
pub trait ShardCipher: Send + Sync {
    /// Name-suffix component, e.g. `age`.
    fn suffix(&self) -> &str;

    /// Encrypt everything read from `plaintext` into `ciphertext`.
    /// The output is shut down before returning.
    async fn encrypt<'a>(
        &self,
        plaintext: BoxedReader<'a>,
        ciphertext: BoxedWriter<'a>,
    ) -> io::Result<()>;

    /// Decrypt everything read from `ciphertext` into `plaintext`.
    /// The output is shut down before returning.
    async fn decrypt<'a>(
        &self,
        ciphertext: BoxedReader<'a>,
        plaintext: BoxedWriter<'a>,
    ) -> io::Result<()>;
}

/// A cipher implemented by an external filter program.
#[derive(Debug, Clone)]
pub struct CommandCipher {
    program: String,
    encrypt_args: Option<Vec<String>>,
    decrypt_args: Option<Vec<String>>,
    suffix: String,
}

impl CommandCipher {
    pub fn new(
        program: &str,
        encrypt_args: Option<Vec<String>>,
        decrypt_args: Option<Vec<String>>,
        suffix: &str,
    ) -> Self {
        Self {
            program: program.to_string(),
            encrypt_args,
            decrypt_args,
            suffix: suffix.to_string(),
        }
    }

    /// `age -r <recipient>` to encrypt, `age -d -i <identity>` to decrypt.
    pub fn age(recipient: Option<&str>, identity: Option<&Path>) -> Self {
        Self::new(
            "age",
            recipient.map(|r| vec!["-r".to_string(), r.to_string()]),
            identity.map(|i| vec!["-d".to_string(), "-i".to_string(), i.display().to_string()]),
            "age",
        )
    }

    /// Like [`CommandCipher::age`], but also accepts `-R <recipients file>` and
    /// a custom program path. Either direction may be left unconfigured.
    pub fn from_config(config: &EncryptionConfig) -> Result<Self> {
        let encrypt_args = match (&config.recipient, &config.recipients_file) {
            (Some(_), Some(_)) => {
                return Err(PipelineError::Config(
                    "set either encryption.recipient or encryption.recipients_file, not both".into(),
                ))
            }
            (Some(recipient), None) => Some(vec!["-r".to_string(), recipient.clone()]),
            (None, Some(file)) => Some(vec!["-R".to_string(), file.display().to_string()]),
            (None, None) => None,
        };
        let decrypt_args = config
            .identity_file
            .as_ref()
            .map(|identity| {
                vec!["-d".to_string(), "-i".to_string(), identity.display().to_string()]
            });

        Ok(Self::new(&config.program, encrypt_args, decrypt_args, "age"))
    }

    pub fn can_encrypt(&self) -> bool {
        self.encrypt_args.is_some()
    }

    pub fn can_decrypt(&self) -> bool {
        self.decrypt_args.is_some()
    }

    async fn pump<'a>(
        &self,
        args: Option<&Vec<String>>,
        direction: &str,
        mut input: BoxedReader<'a>,
        mut output: BoxedWriter<'a>,
    ) -> io::Result<()> {
        let args = args.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no {} key configured for {}", direction, self.program),
            )
        })?;

        debug!("Spawning {} to {}", self.program, direction);
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                io::Error::new(e.kind(), format!("failed to start {}: {}", self.program, e))
            })?;

        let missing = |stream: &str| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("failed to capture {} {}", self.program, stream),
            )
        };
        let mut stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let mut stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let mut stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let feed = async move {
            tokio::io::copy(&mut input, &mut stdin).await?;
            stdin.shutdown().await?;
            Ok::<_, io::Error>(())
        };
        let drain = async move {
            tokio::io::copy(&mut stdout, &mut output).await?;
            output.shutdown().await?;
            Ok::<_, io::Error>(())
        };
        let diagnostics = async move {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text).await;
            text
        };

        let (pumped, diagnostics) = tokio::join!(
            async { tokio::try_join!(feed, drain).map(|_| ()) },
            diagnostics
        );

        if let Err(e) = pumped {
            let _ = child.start_kill();
            let _ = child.wait().await;
            if is_upstream(&e) {
                return Err(e);
            }
            // A broken pipe usually means the program died first; its stderr
            // says why.
            if diagnostics.trim().is_empty() {
                return Err(e);
            }
            return Err(io::Error::new(
                e.kind(),
                format!("{} {} failed: {}: {}", self.program, direction, e, diagnostics.trim()),
            ));
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "{} {} exited with {}: {}",
                    self.program,
                    direction,
                    status,
                    diagnostics.trim()
                ),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ShardCipher for CommandCipher {
    fn suffix(&self) -> &str {
        &self.suffix
    }

    async fn encrypt<'a>(
        &self,
        plaintext: BoxedReader<'a>,
        ciphertext: BoxedWriter<'a>,
    ) -> io::Result<()> {
        self.pump(self.encrypt_args.as_ref(), "encrypt", plaintext, ciphertext).await
    }

    async fn decrypt<'a>(
        &self,
        ciphertext: BoxedReader<'a>,
        plaintext: BoxedWriter<'a>,
    ) -> io::Result<()> {
        self.pump(self.decrypt_args.as_ref(), "decrypt", ciphertext, plaintext).await
    }
}
