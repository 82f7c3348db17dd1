use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "comfy-lb", version, about = "ComfyUI reverse-proxy load balancer")]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "config/comfy-lb.yaml")]
    pub config: PathBuf,
}
