#![forbid(unsafe_code)]

//! **via-demogen** – Demo data generator.
//!
//! Emits an OTel-shaped ingest body to stdout: a steady INFO connection
//! rhythm with an optional ERROR burst in the final minute. Pipe it
//! straight at the ingest endpoint:
//!
//! ```bash
//! via-demogen --steady 500 --burst 30 | \
//!     curl -s -XPOST -H 'content-type: application/json' \
//!     -d @- http://localhost:8080/api/v1/ingest/stream
//! ```

use clap::Parser;
use serde_json::json;
use via_types::now_ts;

#[derive(Parser)]
#[command(name = "via-demogen")]
#[command(about = "Generate a demo ingest body for Vector Incident Atlas")]
#[command(version)]
struct Cli {
    /// Steady INFO events spread over the last ten minutes
    #[arg(long, default_value = "500")]
    steady: i64,

    /// ERROR burst events in the last minute
    #[arg(long, default_value = "30")]
    burst: i64,

    /// Service name stamped on every event
    #[arg(long, default_value = "gateway")]
    service: String,
}

fn main() {
    let cli = Cli::parse();
    let now = now_ts();

    let mut events = Vec::with_capacity((cli.steady + cli.burst).max(0) as usize);
    for i in 0..cli.steady {
        let spread = if cli.steady > 1 {
            (i * 539) / (cli.steady - 1)
        } else {
            0
        };
        events.push(json!({
            "ts": now - 600 + spread,
            "service": cli.service,
            "level": "INFO",
            "message": format!("connection established from 10.2.3.{}:{}", 1 + i % 250, 1024 + i),
        }));
    }
    for i in 0..cli.burst {
        events.push(json!({
            "ts": now - 55 + i % 55,
            "service": cli.service,
            "level": "ERROR",
            "message": format!("assertion failed at /src/io.c:{}", 10 + i),
        }));
    }

    println!("{}", json!({ "events": events }));
}
