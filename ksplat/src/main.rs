use clap::{ArgAction, Parser};
use ksplat_lib::common::ZSTD_MAX_COMPRESSION_LVL;
use ksplat_lib::{
    compress_zstd, decode_to_ply, decode_to_ply_async, encode_ply, encode_ply_async,
    EncodeOptions, SectionOptions, ZstdOptions,
};
use std::cmp::min;
use std::error::Error;
use std::fs;
use std::process;
use std::time::Instant;
use tracing::debug;
use tracing::level_filters::LevelFilter;

#[derive(Parser, Debug)]
#[command(
    name = "ksplat",
    version = "0.1",
    author = "Denis Avvakumov",
    about = "Encodes Gaussian splat PLY files into sortable splat buffers, or decodes them back"
)]
struct Cli {
    #[arg(value_name = "INPUT", help = "Path to the input file.")]
    input: String,

    #[arg(value_name = "OUTPUT", help = "Path to the output file.")]
    output: String,

    #[arg(
        value_name = "COMPRESSION_LEVEL",
        default_value = "1",
        help = "Splat buffer compression level (0 = f32, 1 = quantized)."
    )]
    compression_level: u8,

    #[arg(
        value_name = "MINIMUM_ALPHA",
        default_value = "1",
        help = "Drop splats whose 8-bit alpha is below this value (0..=256)."
    )]
    minimum_alpha: u32,

    #[arg(
        short = 'd',
        long = "decode",
        help = "Decode a splat buffer into a float PLY instead of encoding."
    )]
    decode: bool,

    #[arg(
        long = "block-size",
        value_name = "SIZE",
        default_value = "5.0",
        help = "Side length of a bucket cube."
    )]
    block_size: f32,

    #[arg(
        long = "bucket-size",
        value_name = "COUNT",
        default_value = "256",
        help = "Splats per bucket."
    )]
    bucket_size: usize,

    #[arg(
        short = 'z',
        long = "zstd",
        value_name = "LEVEL",
        help = "Wrap the encoded buffer in a zstd frame with this level."
    )]
    zstd: Option<u32>,

    #[arg(
        short = 'w',
        long = "workers",
        value_name = "WORKERS",
        default_value = "3",
        help = "Set the workers count for ZSTD."
    )]
    workers: u32,

    #[arg(
        short = 'a',
        long = "async",
        default_value = "false",
        help = "Enable asynchronous zstd compression/decompression."
    )]
    async_mode: bool,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v debug, -vv trace)."
    )]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let raw_data = fs::read(&cli.input).unwrap_or_else(|e| {
        eprintln!("Error reading input file {}: {}", cli.input, e);
        process::exit(1);
    });

    let mode = if cli.async_mode {
        "Asynchronous"
    } else {
        "Synchronous"
    };
    let op = if cli.decode { "Decoding" } else { "Encoding" };

    print!(
        "Mode: {} {}\nInput: {} | Output: {}",
        mode, op, cli.input, cli.output
    );
    if cli.decode {
        println!();
    } else {
        println!(
            " | Level: {} | Minimum alpha: {}",
            cli.compression_level, cli.minimum_alpha
        );
    }

    let options = EncodeOptions {
        compression_level: cli.compression_level,
        minimum_alpha: cli.minimum_alpha,
        sections: SectionOptions {
            block_size: cli.block_size,
            bucket_size: cli.bucket_size,
            ..Default::default()
        },
        ..Default::default()
    };
    let zstd = cli.zstd.map(|level| ZstdOptions {
        level: min(level, ZSTD_MAX_COMPRESSION_LVL),
        workers: cli.workers,
    });
    debug!(?options, ?zstd, "parsed command line");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let start = Instant::now();

    let result: Vec<u8> = if cli.async_mode {
        rt.block_on(async {
            let mut buf = Vec::new();
            if cli.decode {
                decode_to_ply_async(&raw_data, &mut buf).await?;
            } else {
                encode_ply_async(&raw_data, &options, zstd, &mut buf).await?;
            }
            Ok::<Vec<u8>, Box<dyn Error + Send + Sync>>(buf)
        })?
    } else if cli.decode {
        let mut buf = Vec::new();
        decode_to_ply(&raw_data, &mut buf)?;
        buf
    } else {
        let encoded = encode_ply(&raw_data, &options)?;
        match zstd {
            Some(z) => compress_zstd(&encoded, z.level, z.workers)?,
            None => encoded,
        }
    };

    let elapsed = start.elapsed().as_millis();
    println!("{} Time: {} ms", op, elapsed);

    fs::write(&cli.output, &result).unwrap_or_else(|e| {
        eprintln!("Error writing output '{}': {}", cli.output, e);
        process::exit(1);
    });
    println!("Successfully wrote to '{}'.", cli.output);

    Ok(())
}
