use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use ocipack::cas::Cas;
use ocipack::idmap::{IdMapping, MapOptions};
use ocipack::image::{self, ConfigEdit};
use ocipack::{repack, unpack};

/// Manipulate OCI container images at rest.
#[derive(Debug, Parser)]
#[clap(name = "ocipack", version)]
struct App {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Args)]
struct MapArgs {
    /// UID mapping to apply, as container:host:length (repeatable)
    #[clap(long = "uid-map", value_name = "C:H:L")]
    uid_map: Vec<String>,
    /// GID mapping to apply, as container:host:length (repeatable)
    #[clap(long = "gid-map", value_name = "C:H:L")]
    gid_map: Vec<String>,
    /// Operate without privileges; ownership maps to the current user
    #[clap(long)]
    rootless: bool,
}

impl MapArgs {
    fn to_options(&self) -> Result<MapOptions> {
        let parse = |maps: &[String]| -> Result<Vec<IdMapping>> {
            maps.iter()
                .map(|m| IdMapping::parse(m).with_context(|| format!("parsing mapping {m:?}")))
                .collect()
        };
        Ok(MapOptions {
            rootless: self.rootless,
            uid_mappings: parse(&self.uid_map)?,
            gid_mappings: parse(&self.gid_map)?,
        }
        .with_rootless_defaults())
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Initialize an image layout, optionally with an empty tagged image.
    Create {
        /// Path of the image layout to create
        #[clap(long)]
        image: PathBuf,
        /// Also create an empty image bound to this reference
        #[clap(long)]
        tag: Option<String>,
    },
    /// Unpack a tagged image into a runtime bundle.
    Unpack {
        /// Path of the image layout
        #[clap(long)]
        image: PathBuf,
        /// Reference to unpack
        #[clap(long)]
        from: String,
        /// Destination bundle directory
        #[clap(long)]
        bundle: PathBuf,
        #[clap(flatten)]
        maps: MapArgs,
    },
    /// Repack a modified bundle into the image as a new layer.
    Repack {
        /// Path of the image layout
        #[clap(long)]
        image: PathBuf,
        /// Reference the bundle was unpacked from
        #[clap(long)]
        from: String,
        /// Bundle directory to repack
        #[clap(long)]
        bundle: PathBuf,
        /// Reference to bind to the repacked image
        #[clap(long)]
        tag: Option<String>,
        #[clap(flatten)]
        maps: MapArgs,
    },
    /// Rewrite the configuration of a tagged image.
    Config {
        /// Path of the image layout
        #[clap(long)]
        image: PathBuf,
        /// Reference whose configuration to rewrite
        #[clap(long)]
        from: String,
        /// Reference to bind the result to (defaults to --from)
        #[clap(long)]
        tag: Option<String>,
        /// Set the default user, as uid[:gid]
        #[clap(long = "config.user", value_name = "USER")]
        user: Option<String>,
        /// Append an environment variable, as KEY=VALUE (repeatable)
        #[clap(long = "config.env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Replace the entrypoint (repeatable, in order)
        #[clap(long = "config.entrypoint", value_name = "ARG")]
        entrypoint: Vec<String>,
        /// Replace the default command (repeatable, in order)
        #[clap(long = "config.cmd", value_name = "ARG")]
        cmd: Vec<String>,
        /// Set the working directory
        #[clap(long = "config.workingdir", value_name = "DIR")]
        workingdir: Option<String>,
    },
}

fn run() -> Result<()> {
    let args = App::parse();

    match args.cmd {
        Command::Create { image, tag } => {
            image::create_image(&image, tag.as_deref())
                .with_context(|| format!("creating image at {}", image.display()))?;
        }
        Command::Unpack {
            image,
            from,
            bundle,
            maps,
        } => {
            let cas = open(&image)?;
            unpack::unpack_bundle(&cas, &from, &bundle, &maps.to_options()?)
                .with_context(|| format!("unpacking {from:?} into {}", bundle.display()))?;
        }
        Command::Repack {
            image,
            from,
            bundle,
            tag,
            maps,
        } => {
            let cas = open(&image)?;
            let descriptor = repack::repack_bundle(
                &cas,
                &from,
                &bundle,
                tag.as_deref(),
                &maps.to_options()?,
            )
            .with_context(|| format!("repacking {} into {from:?}", bundle.display()))?;
            println!("{}", descriptor.digest());
        }
        Command::Config {
            image,
            from,
            tag,
            user,
            env,
            entrypoint,
            cmd,
            workingdir,
        } => {
            let edit = ConfigEdit {
                user,
                env,
                entrypoint: (!entrypoint.is_empty()).then_some(entrypoint),
                cmd: (!cmd.is_empty()).then_some(cmd),
                working_dir: workingdir,
            };
            let cas = open(&image)?;
            let descriptor = image::rewrite_config(&cas, &from, tag.as_deref(), &edit)
                .with_context(|| format!("rewriting configuration of {from:?}"))?;
            println!("{}", descriptor.digest());
        }
    }
    Ok(())
}

fn open(image: &std::path::Path) -> Result<Cas> {
    Cas::open(image).with_context(|| format!("opening image at {}", image.display()))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("ocipack: {e:#}");
        std::process::exit(1);
    }
}
