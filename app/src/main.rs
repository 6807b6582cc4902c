use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use flash_blockdev::{DeviceLayout, FlashBlockDevice};
use flash_mock::MockFlash;
use std::io::{self, Write};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "flashdev_demo", version, about = "Mock NOR-flash block device demo CLI", disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print geometry and the sector layout table
    Info,
    /// Read blocks and print them as hex
    Read { block: u32, count: u32 },
    /// Overlay bytes onto one block, then flush
    Write(WriteArgs),
    /// Fill blocks with a byte value, then flush
    Fill { block: u32, count: u32, value: u8 },
    /// Hexdump a range of blocks
    Dump { block: Option<u32>, count: Option<u32> },
    /// Interactive shell (the cache survives between commands)
    Repl,
}

#[derive(Args, Debug)]
struct WriteArgs {
    block: u32,
    #[arg(long, conflicts_with = "str")] hex: Option<String>,
    #[arg(long, conflicts_with = "hex")] str: Option<String>,
    /// Byte offset within the block
    #[arg(long, default_value_t = 0)] offset: u32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    run_cli(cli)
}

fn new_device() -> FlashBlockDevice<MockFlash> {
    let layout = DeviceLayout::stm32f405();
    let flash = MockFlash::new(layout.runs());
    FlashBlockDevice::new(flash, layout)
}

fn run_cli(cli: Cli) -> Result<()> {
    let mut dev = new_device();
    dev.init();
    match cli.cmd {
        Command::Info => print_info(&dev),
        Command::Read { block, count } => {
            let (bs, _) = dev.geometry();
            let mut buf = vec![0u8; (count * bs) as usize];
            dev.read_blocks(&mut buf, block, count)?;
            println!("{}", hex::encode(buf));
        }
        Command::Write(w) => {
            let data = write_payload(&w)?;
            overlay_block(&mut dev, w.block, w.offset, &data)?;
            dev.flush()?;
            println!("Wrote {} bytes into block {} and flushed.", data.len(), w.block);
            print_stats(&dev);
        }
        Command::Fill { block, count, value } => {
            let (bs, _) = dev.geometry();
            let src = vec![value; (count * bs) as usize];
            dev.write_blocks(&src, block, count)?;
            dev.flush()?;
            println!("Filled {} block(s) from {} with 0x{:02X}.", count, block, value);
            print_stats(&dev);
        }
        Command::Dump { block, count } => {
            let (bs, total) = dev.geometry();
            let start = block.unwrap_or(0);
            let n = count.unwrap_or((total - start).min(4));
            let mut buf = vec![0u8; (n * bs) as usize];
            dev.read_blocks(&mut buf, start, n)?;
            hexdump((start * bs) as usize, &buf);
        }
        Command::Repl => repl()?,
    }
    Ok(())
}

fn write_payload(w: &WriteArgs) -> Result<Vec<u8>> {
    if let Some(h) = &w.hex {
        decode_hex(h)
    } else if let Some(s) = &w.str {
        Ok(s.clone().into_bytes())
    } else {
        bail!("Provide --hex or --str");
    }
}

/// Read-modify-write one block: the device API is whole blocks only.
fn overlay_block(dev: &mut FlashBlockDevice<MockFlash>, block: u32, offset: u32, data: &[u8]) -> Result<()> {
    let (bs, _) = dev.geometry();
    if offset as usize + data.len() > bs as usize {
        bail!("payload of {} bytes at offset {} exceeds the {}-byte block", data.len(), offset, bs);
    }
    let mut buf = vec![0u8; bs as usize];
    dev.read_blocks(&mut buf, block, 1)?;
    buf[offset as usize..offset as usize + data.len()].copy_from_slice(data);
    dev.write_blocks(&buf, block, 1)?;
    Ok(())
}

fn print_info(dev: &FlashBlockDevice<MockFlash>) {
    let (bs, count) = dev.geometry();
    let layout = dev.layout();
    println!("Geometry:");
    println!("- block_size:     {}", bs);
    println!("- block_count:    {}", count);
    println!("- partition_base: 0x{:08X}", layout.partition_base());
    println!("Sector runs:");
    for run in layout.runs() {
        println!(
            "- 0x{:08X}: {} x {} KiB",
            run.base_address,
            run.sector_count,
            run.sector_size / 1024
        );
    }
}

fn print_stats(dev: &FlashBlockDevice<MockFlash>) {
    let flash = dev.flash();
    println!(
        "stats: erases={} programs={} cache_invalidations={}",
        flash.erase_count(),
        flash.program_count(),
        flash.cache_invalidations()
    );
}

fn repl() -> Result<()> {
    let mut dev = new_device();
    dev.init();
    let mut rl = rustyline::Editor::<(), _>::new()?;
    println!("Mock flash block device REPL. Type 'help' or 'quit'.");
    loop {
        let line = match rl.readline("flash> ") {
            Ok(s) => s,
            Err(_) => break,
        };
        let line = line.trim();
        if line.is_empty() { continue; }
        rl.add_history_entry(line).ok();
        match handle_repl_line(&mut dev, line) {
            Ok(Control::Continue) => {}
            Ok(Control::Quit) => break,
            Err(e) => eprintln!("error: {}", e),
        }
        io::stdout().flush().ok();
    }
    Ok(())
}

enum Control { Continue, Quit }

fn handle_repl_line(dev: &mut FlashBlockDevice<MockFlash>, line: &str) -> Result<Control> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.is_empty() { return Ok(Control::Continue); }
    let (bs, _) = dev.geometry();
    match parts[0] {
        "help" => {
            println!("commands: info, read <block> <count>, write <block> (--hex <bytes> | --str <text>) [--offset n], fill <block> <count> <byte>, dump [block] [count], flush, release, stats, quit");
        }
        "quit" | "exit" => return Ok(Control::Quit),
        "info" => print_info(dev),
        "read" => {
            if parts.len() < 3 { bail!("usage: read <block> <count>"); }
            let block = parse_u32(parts[1])?;
            let count = parse_u32(parts[2])?;
            let mut buf = vec![0u8; (count * bs) as usize];
            dev.read_blocks(&mut buf, block, count)?;
            println!("{}", hex::encode(buf));
        }
        "write" => {
            if parts.len() < 3 { bail!("usage: write <block> (--hex <bytes> | --str <text>) [--offset n]"); }
            let block = parse_u32(parts[1])?;
            let mut data: Option<Vec<u8>> = None;
            let mut offset = 0u32;
            let mut i = 2;
            while i < parts.len() {
                match parts[i] {
                    "--hex" => { i += 1; if i >= parts.len() { bail!("missing hex"); } data = Some(decode_hex(parts[i])?); }
                    "--str" => { i += 1; if i >= parts.len() { bail!("missing str"); } data = Some(parts[i].as_bytes().to_vec()); }
                    "--offset" => { i += 1; if i >= parts.len() { bail!("missing offset"); } offset = parse_u32(parts[i])?; }
                    _ => bail!("unknown flag {}", parts[i]),
                }
                i += 1;
            }
            let data = data.ok_or_else(|| anyhow!("provide --hex or --str"))?;
            overlay_block(dev, block, offset, &data)?;
            println!("merged {} bytes into block {} (unflushed)", data.len(), block);
        }
        "fill" => {
            if parts.len() < 4 { bail!("usage: fill <block> <count> <byte>"); }
            let block = parse_u32(parts[1])?;
            let count = parse_u32(parts[2])?;
            let value = parse_u32(parts[3])? as u8;
            let src = vec![value; (count * bs) as usize];
            dev.write_blocks(&src, block, count)?;
            println!("merged {} block(s) (unflushed)", count);
        }
        "dump" => {
            let (_, total) = dev.geometry();
            let start = parts.get(1).map(|s| parse_u32(s)).transpose()?.unwrap_or(0);
            let n = parts.get(2).map(|s| parse_u32(s)).transpose()?.unwrap_or((total - start).min(4));
            let mut buf = vec![0u8; (n * bs) as usize];
            dev.read_blocks(&mut buf, start, n)?;
            hexdump((start * bs) as usize, &buf);
        }
        "flush" => {
            dev.flush()?;
            println!("flushed");
        }
        "release" => {
            dev.flush()?;
            dev.release_cache();
            println!("cache released");
        }
        "stats" => print_stats(dev),
        other => bail!("unknown command {}", other),
    }
    Ok(Control::Continue)
}

fn parse_u32(s: &str) -> Result<u32> {
    if let Some(rest) = s.strip_prefix("0x") {
        u32::from_str_radix(rest, 16).map_err(|_| anyhow!("invalid u32"))
    } else {
        s.parse::<u32>().map_err(|_| anyhow!("invalid u32"))
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);
    let s = s.replace(' ', "").replace('_', "");
    if s.len() % 2 != 0 { bail!("hex must have even length"); }
    hex::decode(s).map_err(|e| anyhow!("{}", e))
}

fn hexdump(start: usize, data: &[u8]) {
    let mut off = 0usize;
    while off < data.len() {
        let line = &data[off..data.len().min(off + 16)];
        print!("{:08X}: ", start + off);
        for i in 0..16 {
            if i < line.len() { print!("{:02X} ", line[i]); } else { print!("   "); }
        }
        print!(" | ");
        for &b in line {
            let c = if (0x20..=0x7E).contains(&b) { b as char } else { '.' };
            print!("{}", c);
        }
        println!();
        off += 16;
    }
}
