// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{ArgGroup, Parser};
use salvage_ds::DataStorage;
use salvage_ds_file::FileStorage;
use salvage_fat::Volume;
use salvage_recover::{parse_digest, RecoverOutcome, Recovery};

/// FAT32 deleted file recovery utility.
#[derive(Parser)]
#[command(name = "salvage", version)]
#[command(group = ArgGroup::new("mode").required(true))]
struct Args {
    /// Disk image containing the FAT32 volume.
    disk: PathBuf,

    /// Print the file system information.
    #[arg(short, long, group = "mode")]
    info: bool,

    /// List the root directory.
    #[arg(short, long, group = "mode")]
    list: bool,

    /// Recover a contiguous file, verified when a digest is given.
    #[arg(short, long, value_name = "FILENAME", group = "mode")]
    recover: Option<String>,

    /// Recover a possibly non-contiguous file, verified against the digest.
    #[arg(
        short = 'R',
        long,
        value_name = "FILENAME",
        group = "mode",
        requires = "sha1"
    )]
    recover_fragmented: Option<String>,

    /// Recover every deleted file with the given name.
    #[arg(short = 'a', long, value_name = "FILENAME", group = "mode")]
    recover_all: Option<String>,

    /// Recover all deleted files.
    #[arg(short = 'A', long, group = "mode")]
    recover_all_deleted: bool,

    /// Expected SHA-1 of the file content, 40 hexadecimal characters.
    #[arg(
        short,
        long,
        value_name = "SHA1",
        conflicts_with_all = ["info", "list", "recover_all", "recover_all_deleted"]
    )]
    sha1: Option<String>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let digest = match &args.sha1 {
        Some(sha1) => Some(parse_digest(sha1).context("Invalid SHA-1 digest")?),
        None => None,
    };
    for name in [&args.recover, &args.recover_fragmented, &args.recover_all]
        .into_iter()
        .flatten()
    {
        if name.is_empty() {
            bail!("File name shall not be empty");
        }
    }

    if args.info || args.list {
        let volume = Volume::new(FileStorage::open_read_only(&args.disk)?)?;
        if args.info {
            print_info(&volume);
        } else {
            print_list(&volume)?;
        }
        return Ok(());
    }

    let volume = Volume::new(FileStorage::open(&args.disk)?)?;
    let recovery = Recovery::new(&volume);
    if let Some(name) = &args.recover {
        report_outcome(name, recovery.recover_named(name, digest.as_ref())?);
    } else if let Some(name) = &args.recover_fragmented {
        let Some(digest) = digest else {
            bail!("A SHA-1 digest is required for fragmented recovery");
        };
        report_outcome(name, recovery.recover_fragmented(name, &digest)?);
    } else if let Some(name) = &args.recover_all {
        match recovery.recover_all_named(name)? {
            0 => println!("{name}: file not found"),
            count => println!("{name}: {count} file(s) recovered"),
        }
    } else {
        let recovered = recovery.recover_all_deleted()?;
        for name in &recovered {
            println!("{name}: recovered");
        }
        if recovered.is_empty() {
            println!("No deleted files were found.");
        } else {
            println!("Successfully recovered {} file(s)", recovered.len());
        }
    }
    Ok(())
}

fn print_info<DS: DataStorage>(volume: &Volume<DS>) {
    println!("Number of FATs = {}", volume.fat_count());
    println!("Number of bytes per sector = {}", volume.bytes_per_sector());
    println!(
        "Number of sectors per cluster = {}",
        volume.sectors_per_cluster()
    );
    println!("Number of reserved sectors = {}", volume.reserved_sectors());
}

fn print_list<DS: DataStorage>(volume: &Volume<DS>) -> anyhow::Result<()> {
    let mut total = 0;
    for slot in volume.root_entries() {
        let entry = slot?.entry;
        if entry.is_deleted() || entry.is_long_name() || entry.is_volume_label() {
            continue;
        }
        let name = entry.display_name();
        if entry.is_directory() {
            println!("{name}/ (starting cluster = {})", entry.first_cluster());
        } else if entry.file_size() == 0 {
            println!("{name} (size = 0)");
        } else {
            println!(
                "{name} (size = {}, starting cluster = {})",
                entry.file_size(),
                entry.first_cluster()
            );
        }
        total += 1;
    }
    println!("Total number of entries = {total}");
    Ok(())
}

fn report_outcome(name: &str, outcome: RecoverOutcome) {
    match outcome {
        RecoverOutcome::NotFound => println!("{name}: file not found"),
        RecoverOutcome::Recovered {
            with_digest,
            ambiguous,
        } => {
            if with_digest {
                println!("{name}: successfully recovered with SHA-1");
            } else {
                println!("{name}: successfully recovered");
            }
            if ambiguous {
                println!("{name}: multiple candidates found");
            }
        }
    }
}
