use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use anyhow::Context;
use clap::Parser;
use mmap_rs::{MmapFlags, MmapOptions};

use arbor::config::DumpConfig;
use arbor::journal::{self, parse_record_header, type_name, RECORD_HEADER_SIZE};
use arbor::page::{Page, PageType};
use arbor::volume::Volume;
use arbor::wire;

fn main() -> anyhow::Result<()> {
    let config = DumpConfig::parse();

    dump_journal(&config)?;
    if let Some(ref name) = config.volume {
        dump_volume(&config, name)?;
    }
    Ok(())
}

fn dump_journal(config: &DumpConfig) -> anyhow::Result<()> {
    let mut seqs: Vec<u64> = std::fs::read_dir(&config.dir)
        .with_context(|| format!("read engine directory {}", config.dir.display()))?
        .filter_map(|e| e.ok())
        .filter_map(|e| journal::file_seq(&e.file_name().to_string_lossy()))
        .collect();
    seqs.sort_unstable();

    if seqs.is_empty() {
        println!("no journal files in {}", config.dir.display());
        return Ok(());
    }

    for seq in seqs {
        let path = config.dir.join(journal::file_name(seq));
        let data = map_file(&path)?;
        println!("journal seq {seq:012x}: {} bytes", data.len());

        let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut pos = 0usize;
        while pos + RECORD_HEADER_SIZE <= data.len() {
            if data[pos..pos + 4] == [0, 0, 0, 0] {
                break;
            }
            let header = match parse_record_header(&data[pos..]) {
                Ok(h) => h,
                Err(err) => {
                    println!("  !! {err} at offset {pos}");
                    break;
                }
            };
            if pos + header.len > data.len() {
                println!("  !! partial record at offset {pos} (crash truncation)");
                break;
            }
            *counts.entry(type_name(header.kind)).or_default() += 1;
            if config.records {
                println!(
                    "  {:>10}  {}  len={} ts={}",
                    pos,
                    type_name(header.kind),
                    header.len,
                    header.ts
                );
            }
            pos += header.len;
        }
        for (kind, count) in counts {
            println!("  {kind}: {count}");
        }
    }
    Ok(())
}

fn dump_volume(config: &DumpConfig, name: &str) -> anyhow::Result<()> {
    let path = config.dir.join(format!("{name}.vol"));
    let volume = Volume::open_with_context(&path, name, config.page_size)?;
    println!("{volume}");
    for tree in volume.tree_names() {
        let meta = volume.tree_meta(&tree).expect("listed tree");
        println!("  tree {:?}: root={} depth={}", tree, meta.root, meta.depth);
    }

    let data = map_file(&path)?;
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for chunk in data.chunks_exact(config.page_size) {
        let kind = PageType::from_u8(chunk[0])
            .map(|t| format!("{t:?}"))
            .unwrap_or_else(|_| "unused".to_string());
        *counts.entry(kind).or_default() += 1;
    }
    for (kind, count) in &counts {
        println!("  {kind}: {count} pages");
    }

    // verify key ordering within every tree page.
    let mut bad = 0usize;
    for (no, chunk) in data.chunks_exact(config.page_size).enumerate() {
        if matches!(
            PageType::from_u8(chunk[0]),
            Ok(PageType::Data) | Ok(PageType::Index)
        ) {
            let page = Page::from_bytes(chunk.to_vec());
            if let Err(err) = page.verify() {
                println!("  !! page {no}: {err}");
                bad += 1;
            }
        }
    }
    if bad == 0 {
        println!("  all tree pages verify clean");
    }

    let head_crc = wire::get_u32(&data[36..]);
    println!("  head crc {head_crc:#010x}");
    Ok(())
}

fn map_file(path: &Path) -> anyhow::Result<Vec<u8>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let size = file.metadata().context("file metadata")?.len() as usize;
    if size == 0 {
        return Ok(Vec::new());
    }
    let mmap = unsafe {
        MmapOptions::new(size)
            .context("mmap options")?
            .with_file(&file, 0)
            .with_flags(MmapFlags::SHARED)
            .map()
            .context("mmap journal file")?
    };
    Ok(mmap.as_slice().to_vec())
}
