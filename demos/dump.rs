//! Smoke-test CLI: parse a PE file, print its section table and resource
//! tree, then round-trip it through `write()` and report whether the
//! output re-parses cleanly. Grounded on the teacher's `main.rs`
//! (`open_file_and_read_bytes`, `print_color`), swapping the disassembler/
//! TUI for a plain dump since this crate edits PE images rather than
//! browsing them.

use anyhow::{Context, Result};
use std::io::Write;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};
use winpe::resource::RsrcEntry;
use winpe::PE;

fn print_color(stream: &mut StandardStream, color: Color, text: &str) -> Result<()> {
    stream.set_color(ColorSpec::new().set_fg(Some(color)))?;
    write!(stream, "{}", text)?;
    stream.reset()?;
    Ok(())
}

fn open_file_and_read_bytes(path: &str) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path))
}

fn dump_resources(stream: &mut StandardStream, entry: RsrcEntry<'_>, depth: usize) -> Result<()> {
    let indent = "  ".repeat(depth);
    if entry.is_directory() {
        let (_, timestamp, _, _) = entry.directory_meta()?;
        if timestamp != 0 {
            let when = chrono::DateTime::from_timestamp(timestamp as i64, 0)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_else(|| timestamp.to_string());
            writeln!(stream, "{}(directory stamped {})", indent, when)?;
        }
        for child in entry.children()? {
            write!(stream, "{}", indent)?;
            print_color(stream, Color::Yellow, &format!("{}\n", child.path()))?;
            dump_resources(stream, child, depth + 1)?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let mut stream = StandardStream::stdout(ColorChoice::Auto);

    let path = std::env::args()
        .nth(1)
        .context("usage: winpe-dump <path-to-pe-file>")?;
    let bytes = open_file_and_read_bytes(&path)?;

    let mut pe = PE::parse(&bytes, None).context("failed to parse PE image")?;
    print_color(&mut stream, Color::Green, "parsed OK\n")?;

    writeln!(stream, "sections:")?;
    for section in pe.sections() {
        writeln!(
            stream,
            "  {:<10} va={:#010x} vs={:#08x} raw={:#08x}",
            section.tag_display(),
            section.virtual_address,
            section.virtual_size,
            section.raw_data.len()
        )?;
    }

    match pe.rsrc()? {
        Some(tree) => {
            writeln!(stream, "resources:")?;
            dump_resources(&mut stream, tree.root_entry(), 1)?;
        }
        None => writeln!(stream, "no .rsrc section")?,
    }

    let out = pe.write().context("failed to re-emit PE image")?;
    match PE::parse(&out, None) {
        Ok(_) => print_color(&mut stream, Color::Green, "round-trip OK\n")?,
        Err(e) => print_color(&mut stream, Color::Red, &format!("round-trip FAILED: {}\n", e))?,
    }

    Ok(())
}
