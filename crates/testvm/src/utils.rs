use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;

use crate::error::Error;

/// Parse a memory string (like "2G", "1024M", "512") to megabytes
pub(crate) fn parse_memory_to_mb(memory_str: &str) -> Result<u32> {
    let memory_str = memory_str.trim();

    let Some(last_char) = memory_str.chars().last() else {
        return Err(eyre!(
            "Memory specification cannot be empty - please provide a value like '2G', '1024M', or '512'"
        ));
    };

    let mb = match last_char.to_ascii_uppercase() {
        'G' => {
            let gb: f64 = memory_str[..memory_str.len() - 1]
                .parse()
                .with_context(|| format!("Invalid number in memory specification {memory_str:?}"))?;
            (gb * 1024.0) as u32
        }
        'M' => memory_str[..memory_str.len() - 1]
            .parse()
            .with_context(|| format!("Invalid number in memory specification {memory_str:?}"))?,
        'K' => {
            let kb: u32 = memory_str[..memory_str.len() - 1]
                .parse()
                .with_context(|| format!("Invalid number in memory specification {memory_str:?}"))?;
            kb / 1024
        }
        // No suffix, assume megabytes
        _ => memory_str
            .parse()
            .with_context(|| format!("Invalid number in memory specification {memory_str:?}"))?,
    };

    if mb == 0 {
        return Err(eyre!("Memory specification {memory_str:?} is less than 1M"));
    }
    Ok(mb)
}

/// Parse a drive size given as a plain megabyte count (e.g. "10240")
pub(crate) fn parse_drive_size_mb(size_str: &str) -> Result<u64> {
    match size_str.trim().parse::<u64>() {
        Ok(mb) if mb > 0 => Ok(mb),
        _ => Err(Error::InvalidSize(size_str.to_owned()).into()),
    }
}
