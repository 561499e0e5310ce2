// Copyright (c) 2024 The Confidential Envelope Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, ValueEnum};
use confidential_envelope::{
    payload::{
        Certificate, CertificateFormat, ConfidentialString, Content, Jwk, NamedValue, Secret,
        SubscriptionKeys,
    },
    ConfidentialData, Consumer, ConsumerConfig, Payload, Producer, Protection,
};
use crypto::rsa::{RSAKeyPair, RSAPublicKey};
use kms::plugins::local::LocalRsaKey;
use log::{info, warn};
use tokio::{
    fs,
    io::{self, AsyncReadExt, AsyncWriteExt},
};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "envelope")]
#[command(bin_name = "envelope")]
#[command(author, version, about, long_about = None)]
enum Cli {
    /// Generate an RSA wrapping key pair
    Keygen(KeygenArgs),

    /// Seal a payload into an armored envelope
    Seal(SealArgs),

    /// Release the payload of an armored envelope
    Unseal(UnsealArgs),
}

#[derive(Args)]
struct KeygenArgs {
    /// where to write the private key (PKCS#1 PEM)
    #[arg(long)]
    private_key: String,

    /// where to write the public key (SPKI PEM)
    #[arg(long)]
    public_key: String,

    #[arg(long, default_value_t = 2048)]
    bits: usize,
}

#[derive(Clone, Copy, ValueEnum)]
enum Model {
    String,
    Secret,
    Key,
    Certificate,
    NamedValue,
    Subscription,
    Content,
}

#[derive(Args)]
struct SealArgs {
    /// payload model
    #[arg(short, long, value_enum)]
    model: Model,

    /// file with the plaintext, stdin when absent
    #[arg(short, long)]
    input: Option<String>,

    /// where to write the armored envelope, stdout when absent
    #[arg(short, long)]
    output: Option<String>,

    /// PEM public half of the wrapping key
    #[arg(long)]
    public_key: String,

    /// wrapping key hint, `vault/key/version/algorithm`
    #[arg(long)]
    hint: String,

    /// content type of a `secret`
    #[arg(long)]
    content_type: Option<String>,

    /// `pem` or `pkcs12` for a `certificate`, detected when absent
    #[arg(long)]
    format: Option<String>,

    /// file holding the password of a `certificate`
    #[arg(long)]
    password_file: Option<String>,

    /// Unix seconds after which an unused envelope can no longer be used
    #[arg(long, default_value_t = 0)]
    create_limit: i64,

    /// Unix seconds after which the envelope can no longer be used
    #[arg(long, default_value_t = 0)]
    expiry: i64,

    /// maximum number of releases, 0 for unlimited
    #[arg(long, default_value_t = 0)]
    num_uses: u64,

    #[arg(long = "provider-constraint")]
    provider_constraints: Vec<String>,

    #[arg(long = "placement-constraint")]
    placement_constraints: Vec<String>,
}

#[derive(Args)]
struct UnsealArgs {
    /// file with the armored envelope, stdin when absent
    #[arg(short, long)]
    input: Option<String>,

    /// where to write the plaintext, stdout when absent
    #[arg(short, long)]
    output: Option<String>,

    /// PEM private wrapping key. Without it the key service named by the
    /// configuration is used.
    #[arg(long)]
    private_key: Option<String>,

    /// consumer configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// placement target the plaintext is released for
    #[arg(short, long)]
    target: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    match Cli::parse() {
        Cli::Keygen(args) => keygen(&args).await,
        Cli::Seal(args) => seal(&args).await,
        Cli::Unseal(args) => unseal(&args).await,
    }
}

async fn read_input(path: Option<&str>) -> Result<Zeroizing<Vec<u8>>> {
    let mut buf = Zeroizing::new(Vec::new());
    match path {
        Some(path) => buf.extend_from_slice(
            &fs::read(path)
                .await
                .with_context(|| format!("read {path} failed"))?,
        ),
        None => {
            io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("read stdin failed")?;
        }
    }
    Ok(buf)
}

async fn write_output(path: Option<&str>, data: &[u8]) -> Result<()> {
    match path {
        Some(path) => fs::write(path, data)
            .await
            .with_context(|| format!("write {path} failed")),
        None => {
            let mut stdout = io::stdout();
            stdout.write_all(data).await.context("write stdout failed")?;
            stdout.flush().await.context("write stdout failed")
        }
    }
}

/// Write key material readable by the owner only, also when `path` already
/// exists with a wider mode.
async fn write_private(path: &str, data: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options
        .open(path)
        .await
        .with_context(|| format!("create {path} failed"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("restrict {path} failed"))?;
    }
    file.write_all(data)
        .await
        .with_context(|| format!("write {path} failed"))?;
    file.flush()
        .await
        .with_context(|| format!("write {path} failed"))
}

async fn keygen(args: &KeygenArgs) -> Result<()> {
    let key_pair = RSAKeyPair::with_bits(args.bits).context("generate RSA key failed")?;
    let private = key_pair.to_pkcs1_pem().context("export private key failed")?;
    let public = key_pair
        .public_key()
        .to_pem()
        .context("export public key failed")?;

    write_private(&args.private_key, private.as_bytes()).await?;
    write_output(Some(&args.public_key), public.as_bytes()).await?;
    info!("wrote {} and {}", args.private_key, args.public_key);
    Ok(())
}

fn utf8(input: &[u8]) -> Result<&str> {
    std::str::from_utf8(input).context("input is not UTF-8")
}

fn payload_from_input(args: &SealArgs, input: &[u8], password: Option<&str>) -> Result<Payload> {
    let payload = match args.model {
        Model::String => Payload::String(ConfidentialString::new(utf8(input)?)),
        Model::Secret => Payload::Secret(Secret::new(utf8(input)?, args.content_type.as_deref())),
        Model::Key => Payload::Key(Jwk::import(input)?),
        Model::Certificate => {
            let format = match &args.format {
                Some(format) => format
                    .parse()
                    .map_err(|_| anyhow!("unknown certificate format `{format}`"))?,
                None => CertificateFormat::detect(input),
            };
            Payload::Certificate(Certificate::import(format, input, password)?)
        }
        Model::NamedValue => Payload::NamedValue(NamedValue::new(utf8(input)?)),
        Model::Subscription => Payload::SubscriptionKeys(SubscriptionKeys::from_bytes(input)?),
        Model::Content => Payload::Content(Content::new(utf8(input)?)),
    };
    Ok(payload)
}

async fn seal(args: &SealArgs) -> Result<()> {
    let input = read_input(args.input.as_deref()).await?;
    let password = match &args.password_file {
        Some(path) => Some(Zeroizing::new(
            fs::read_to_string(path)
                .await
                .with_context(|| format!("read {path} failed"))?
                .trim_end()
                .to_string(),
        )),
        None => None,
    };
    let payload = payload_from_input(args, &input, password.as_ref().map(|p| p.as_str()))?;

    let mut protection = Protection::default()
        .with_create_limit(args.create_limit)
        .with_expiry(args.expiry)
        .with_num_uses(args.num_uses);
    for constraint in &args.provider_constraints {
        protection = protection.with_provider_constraint(constraint);
    }
    for constraint in &args.placement_constraints {
        protection = protection.with_placement_constraint(constraint);
    }

    let pem = fs::read_to_string(&args.public_key)
        .await
        .with_context(|| format!("read {} failed", args.public_key))?;
    let public_key = RSAPublicKey::from_pem(&pem).context("parse public key failed")?;

    let armored = Producer::new(&args.hint, public_key)?.encrypt_payload(&payload, &protection)?;
    write_output(args.output.as_deref(), armored.as_bytes()).await
}

async fn unseal(args: &UnsealArgs) -> Result<()> {
    let config = ConsumerConfig::new(args.config.clone())?;
    let consumer = match &args.private_key {
        Some(path) => {
            let decrypter = Arc::new(LocalRsaKey::from_file(path).await?);
            let tracker = config.open_tracker().await?;
            let consumer = Consumer::new(config, decrypter)?;
            match tracker {
                Some(tracker) => consumer.with_tracker(tracker),
                None => consumer,
            }
        }
        None => Consumer::from_config(config).await?,
    };

    let input = read_input(args.input.as_deref()).await?;
    let released = match consumer
        .decrypt_payload(utf8(&input)?, args.target.as_deref(), &CancellationToken::new())
        .await
    {
        Ok(released) => released,
        Err(e) => bail!("{}: {}", e.kind(), e.safe_message()),
    };
    for diagnostic in &released.diagnostics {
        warn!("{}", diagnostic.message());
    }

    let plaintext = released.payload.to_bytes()?;
    write_output(args.output.as_deref(), &plaintext).await
}
