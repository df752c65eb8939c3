/*
 * BSD 2-Clause License
 *
 * Copyright (c) 2021, Khaled Emara
 * All rights reserved.
 *
 * Redistribution and use in source and binary forms, with or without
 * modification, are permitted provided that the following conditions are met:
 *
 * 1. Redistributions of source code must retain the above copyright notice, this
 *    list of conditions and the following disclaimer.
 *
 * 2. Redistributions in binary form must reproduce the above copyright notice,
 *    this list of conditions and the following disclaimer in the documentation
 *    and/or other materials provided with the distribution.
 *
 * THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS"
 * AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
 * IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
 * DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE
 * FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
 * DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
 * SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER
 * CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY,
 * OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
 * OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
 */
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use atticfs::{Attic, Config, SystemContext};

#[derive(Parser)]
#[command(name = "attic", version, about = "Browse vintage Mac archives as a filesystem")]
struct Cli {
    /// Host directory to mount.
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List a directory (the root when PATH is omitted).
    Ls { path: Option<String> },
    /// Write a file's bytes to stdout.
    Cat { path: String },
    /// Recursively list every path in the union.
    Tree,
}

fn cache_config() -> Config {
    let mut cfg = Config::default();
    // Collaborator knob: cache budget override in gigabytes.
    if let Some(gb) = std::env::var("ATTIC_CACHE_GB")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
    {
        cfg.cache_bytes = gb << 30;
    }
    cfg
}

fn run(cli: Cli) -> atticfs::Result<()> {
    let attic = Attic::new(SystemContext::new(cache_config()), &cli.root)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Command::Ls { path } => {
            let path = path.as_deref().unwrap_or(".");
            for entry in attic.read_dir(path)? {
                let info = entry.info();
                let kind = if info.is_dir() { "d" } else { "-" };
                writeln!(out, "{kind} {:>12} {}", info.size, info.name)?;
            }
        }
        Command::Cat { path } => {
            let mut file = attic.open(&path)?;
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])?;
            }
        }
        Command::Tree => {
            for item in attic.walk() {
                let (path, info) = item?;
                let kind = if info.is_dir() { "d" } else { "-" };
                writeln!(out, "{kind} {:>12} {}", info.size, path)?;
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("attic: {e}");
            ExitCode::FAILURE
        }
    }
}
