use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, bail};
use clap::Parser;
use log::{LevelFilter, info, warn};

use ncakit::crypto::AesKey128;
use ncakit::formats::nca::{Nca, NcaOptions};
use ncakit::keys::KeySet;

/// List and extract the files of every section of an NCA.
#[derive(Parser)]
struct Args {
    /// Input NCA.
    nca: PathBuf,
    /// Output directory; only lists files when omitted.
    #[arg(short, long)]
    out: Option<PathBuf>,
    #[arg(long, default_value = "prod.keys")]
    prod_keys: PathBuf,
    #[arg(long)]
    title_keys: Option<PathBuf>,
    /// Decrypted body key (32 hex digits).
    #[arg(long)]
    body_key: Option<String>,
    /// Skip the header signature check.
    #[arg(long)]
    no_signature: bool,
    #[arg(short, long)]
    verbose: bool,
}

/// `name` from the archive as a relative path, or `None` if it is empty or
/// would leave the output directory.
fn relative_path(name: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter(None, if args.verbose { LevelFilter::Debug } else { LevelFilter::Info })
        .init();

    let mut keys = KeySet::new();
    let prod = File::open(&args.prod_keys)
        .with_context(|| format!("opening {}", args.prod_keys.display()))?;
    keys.load_prod_keys(prod)?;
    if let Some(path) = &args.title_keys {
        keys.load_title_keys(File::open(path)?)?;
    }
    keys.derive_keys();

    let mut options = NcaOptions {
        verify_signature: !args.no_signature,
        ..NcaOptions::default()
    };
    if let Some(hex_key) = &args.body_key {
        let mut key = [0u8; 16];
        hex::decode_to_slice(hex_key, &mut key).context("parsing --body-key")?;
        options.body_key = Some(AesKey128(key));
    }

    let nca = Nca::open(File::open(&args.nca)?, &keys, &options)?;
    let header = nca.header();
    info!(
        "program id {:016X}, {:?}, signature {:?}",
        header.program_id,
        header.content_type,
        nca.signature_status()
    );
    if nca.partitions().is_empty() {
        bail!("archive has no sections");
    }

    for part in nca.partitions() {
        let index = part.header_index;
        let view = match nca.open_filesystem(index) {
            Ok(view) => view,
            Err(e) => {
                warn!("section {index}: {e}");
                continue;
            }
        };
        for file in view.files() {
            println!("section{index}/{} ({:#x} bytes)", file.path, file.size);
            let Some(out) = &args.out else { continue };
            let Some(relative) = relative_path(&file.path) else {
                warn!("section {index}: skipping unsafe path {:?}", file.path);
                continue;
            };
            let dest = out.join(format!("section{index}")).join(relative);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            io::copy(&mut view.open(file), &mut File::create(&dest)?)
                .with_context(|| format!("extracting {}", file.path))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_names_stay_inside_the_output() {
        assert_eq!(relative_path("sub/deep.bin"), Some(PathBuf::from("sub/deep.bin")));
        assert_eq!(relative_path("./main"), Some(PathBuf::from("main")));
        assert_eq!(relative_path("../../x"), None);
        assert_eq!(relative_path("a/../../x"), None);
        assert_eq!(relative_path("/etc/x"), None);
        assert_eq!(relative_path(""), None);
    }
}
