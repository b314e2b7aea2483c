#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::env;
use std::path::Path;
use tracing_subscriber::EnvFilter;
use vaultfs::{
    BLOCK_SIZE, FormatOptions, GDT_BLOCK, InodeAttr, MountOptions, SUPERBLOCK_BLOCK, StatFs,
    Superblock, VaultFs, format,
};
use vfs_block::{BlockDevice, ByteBlockDevice, FileByteDevice};
use vfs_ondisk::{GroupDesc, parse_gdt};

const LOG_ENV: &str = "VAULTFS_LOG";

#[derive(Debug, Serialize)]
struct InspectOutput {
    block_size: u32,
    blocks_count: u32,
    inodes_count: u32,
    free_blocks_count: u32,
    free_inodes_count: u32,
    blocks_per_group: u32,
    inodes_per_group: u32,
    groups_count: u32,
    mount_time: u64,
    password_hash_set: bool,
    groups: Vec<GroupDesc>,
}

#[derive(Debug, Serialize)]
struct LsEntry {
    name: String,
    #[serde(flatten)]
    attr: InodeAttr,
}

fn main() {
    init_logging();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    let rest: Vec<String> = args.collect();
    let json = rest.iter().any(|arg| arg == "--json");

    match command.as_str() {
        "mkfs" => {
            let Some(path) = rest.first() else {
                bail!("mkfs requires an image path");
            };
            mkfs(Path::new(path), &rest[1..])
        }
        "inspect" => {
            let Some(path) = rest.first() else {
                bail!("inspect requires an image path");
            };
            inspect(Path::new(path), json)
        }
        "statfs" => {
            let Some(path) = rest.first() else {
                bail!("statfs requires an image path");
            };
            statfs(Path::new(path), json)
        }
        "ls" => {
            let Some(path) = rest.first() else {
                bail!("ls requires <image-path> [dir]");
            };
            let dir = rest
                .get(1)
                .filter(|arg| !arg.starts_with("--"))
                .map_or("/", String::as_str);
            ls(Path::new(path), dir, json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("vaultfs\n");
    println!("USAGE:");
    println!(
        "  vaultfs mkfs <image-path> --blocks <n> [--blocks-per-group <n>] [--inodes-per-group <n>] [--password-hash <text>]"
    );
    println!("  vaultfs inspect <image-path> [--json]");
    println!("  vaultfs statfs <image-path> [--json]");
    println!("  vaultfs ls <image-path> [dir] [--json]");
    println!();
    println!("Set {LOG_ENV} (e.g. {LOG_ENV}=debug) to control log output on stderr.");
}

/// Value following `flag` in `args`.
fn flag_value<'a>(args: &'a [String], flag: &str) -> Result<Option<&'a str>> {
    let Some(pos) = args.iter().position(|arg| arg == flag) else {
        return Ok(None);
    };
    match args.get(pos + 1) {
        Some(value) => Ok(Some(value.as_str())),
        None => bail!("{flag} requires a value"),
    }
}

fn flag_u32(args: &[String], flag: &str) -> Result<Option<u32>> {
    flag_value(args, flag)?
        .map(|value| {
            value
                .parse::<u32>()
                .with_context(|| format!("{flag}: invalid number {value:?}"))
        })
        .transpose()
}

fn mkfs(path: &Path, args: &[String]) -> Result<()> {
    let Some(blocks) = flag_u32(args, "--blocks")? else {
        bail!("mkfs requires --blocks <n>");
    };
    let mut options = FormatOptions::default();
    if let Some(bpg) = flag_u32(args, "--blocks-per-group")? {
        options.blocks_per_group = bpg;
    }
    if let Some(ipg) = flag_u32(args, "--inodes-per-group")? {
        options.inodes_per_group = ipg;
    }
    if let Some(hash) = flag_value(args, "--password-hash")? {
        options.password_hash = hash.as_bytes().to_vec();
    }

    let len = u64::from(blocks) * u64::from(BLOCK_SIZE);
    let file = FileByteDevice::create(path, len)
        .with_context(|| format!("failed to create image: {}", path.display()))?;
    let dev = ByteBlockDevice::new(file, BLOCK_SIZE).context("wrap image as block device")?;
    let sb = format(&dev, &options)
        .with_context(|| format!("failed to format {}", path.display()))?;
    println!(
        "formatted {}: {} blocks, {} groups, {} inodes",
        path.display(),
        sb.blocks_count,
        sb.groups_count,
        sb.inodes_count
    );
    Ok(())
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let file = FileByteDevice::open(path)
        .with_context(|| format!("failed to open image: {}", path.display()))?;
    let dev = ByteBlockDevice::new(file, BLOCK_SIZE).context("wrap image as block device")?;
    let sb = Superblock::parse(dev.read_block(SUPERBLOCK_BLOCK)?.as_slice())
        .with_context(|| format!("{} is not a VaultFS image", path.display()))?;
    let groups = parse_gdt(
        dev.read_block(GDT_BLOCK)?.as_slice(),
        sb.groups_count,
    )
    .context("decode group descriptor table")?;

    let output = InspectOutput {
        block_size: BLOCK_SIZE,
        blocks_count: sb.blocks_count,
        inodes_count: sb.inodes_count,
        free_blocks_count: sb.free_blocks_count,
        free_inodes_count: sb.free_inodes_count,
        blocks_per_group: sb.effective_blocks_per_group(),
        inodes_per_group: sb.effective_inodes_per_group(),
        groups_count: sb.groups_count,
        mount_time: sb.mount_time,
        password_hash_set: sb.password_hash.iter().any(|&b| b != 0),
        groups,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
        return Ok(());
    }
    println!("VaultFS Inspector");
    println!("block_size: {}", output.block_size);
    println!("blocks_count: {}", output.blocks_count);
    println!("inodes_count: {}", output.inodes_count);
    println!("free_blocks_count: {}", output.free_blocks_count);
    println!("free_inodes_count: {}", output.free_inodes_count);
    println!("blocks_per_group: {}", output.blocks_per_group);
    println!("inodes_per_group: {}", output.inodes_per_group);
    println!("mount_time: {}", output.mount_time);
    println!("password_hash_set: {}", output.password_hash_set);
    for (g, desc) in output.groups.iter().enumerate() {
        println!(
            "group {g}: free_blocks={} free_inodes={}",
            desc.free_blocks_count, desc.free_inodes_count
        );
    }
    Ok(())
}

fn open(path: &Path) -> Result<VaultFs> {
    VaultFs::open(path, &MountOptions::default())
        .with_context(|| format!("failed to mount {}", path.display()))
}

fn statfs(path: &Path, json: bool) -> Result<()> {
    let fs = open(path)?;
    let st: StatFs = fs.statfs();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&st).context("serialize output")?
        );
    } else {
        println!("block_size: {}", st.block_size);
        println!("blocks: {} ({} free)", st.blocks, st.free_blocks);
        println!("files: {} ({} free)", st.files, st.free_files);
        println!("name_max: {}", st.name_max);
    }
    fs.unmount().context("unmount")?;
    Ok(())
}

fn ls(path: &Path, dir: &str, json: bool) -> Result<()> {
    let fs = open(path)?;
    let ino = fs
        .resolve_path(dir)
        .with_context(|| format!("resolve {dir}"))?;
    let mut entries = Vec::new();
    for entry in fs.read_dir(ino, 0).with_context(|| format!("read {dir}"))? {
        let attr = fs.stat(entry.ino).with_context(|| format!("stat {}", entry.ino))?;
        entries.push(LsEntry {
            name: entry.name_str(),
            attr,
        });
    }

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).context("serialize output")?
        );
    } else {
        for e in &entries {
            println!(
                "{:>8} {:o} {} {:>10} {}{}",
                e.attr.ino,
                e.attr.mode,
                e.attr.protection,
                e.attr.size,
                e.name,
                if e.attr.committed { " [committed]" } else { "" }
            );
        }
    }
    fs.unmount().context("unmount")?;
    Ok(())
}
