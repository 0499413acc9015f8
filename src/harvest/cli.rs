//! Command line surface

use std::path::PathBuf;

use clap::Parser;

use crate::harvest::config_loader::Overrides;

#[derive(Parser, Debug, Clone)]
#[command(name = "image_harvester", version, about = "Download, normalize and tidy keyword image sets")]
pub struct Cli {
    /// Search keyword
    #[arg(long)]
    pub keyword: Option<String>,

    /// Minimum file size (KB)
    #[arg(long = "min_file_size")]
    pub min_file_size: Option<u64>,

    /// Target image width
    #[arg(long = "target_width")]
    pub target_width: Option<u32>,

    /// Target image height
    #[arg(long = "target_height")]
    pub target_height: Option<u32>,

    /// Maximum search pages (about 30 images per page)
    #[arg(long = "max_pages")]
    pub max_pages: Option<usize>,

    /// Target storage folder
    #[arg(long = "target_folder")]
    pub target_folder: Option<PathBuf>,

    /// Output format (jpg, png, webp, ...)
    #[arg(long = "target_format")]
    pub target_format: Option<String>,

    /// Simultaneous downloads
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Configuration file
    #[arg(long, default_value = "harvester.toml")]
    pub config: PathBuf,
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            keyword: self.keyword.clone(),
            min_file_size_kb: self.min_file_size,
            target_width: self.target_width,
            target_height: self.target_height,
            max_pages: self.max_pages,
            target_folder: self.target_folder.clone(),
            target_format: self.target_format.clone(),
            concurrency: self.concurrency,
        }
    }
}
