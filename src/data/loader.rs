use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use serde::{Deserialize, Serialize};
use log::{info, warn, error};

use crate::data::tick::{FIELD_PRICE, FIELD_SIZE, FIELD_SYMBOL, FIELD_TIMESTAMP};

/// One replayable trade: price and size, stamped with the wall clock on replay.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TickRow {
    pub price: f64,
    pub size: f64,
}

impl TickRow {
    pub fn from_csv_line(line: &str, line_num: usize) -> Result<Self, String> {
        let fields: Vec<&str> = line.split(',').map(|f| f.trim()).collect();

        if fields.len() != 2 {
            return Err(format!(
                "Invalid CSV format at line {}: expected 2 fields, got {}",
                line_num + 1,
                fields.len()
            ));
        }

        let price: f64 = fields[0].parse()
            .map_err(|e| format!("Invalid price at line {}: {}", line_num + 1, e))?;
        if !price.is_finite() || price <= 0.0 {
            return Err(format!("Non-positive price at line {}", line_num + 1));
        }
        let size: f64 = fields[1].parse()
            .map_err(|e| format!("Invalid size at line {}: {}", line_num + 1, e))?;

        Ok(TickRow { price, size })
    }

    pub fn to_fields(&self, symbol: &str, timestamp: i64) -> Vec<(String, String)> {
        vec![
            (FIELD_SYMBOL.to_string(), symbol.to_string()),
            (FIELD_PRICE.to_string(), self.price.to_string()),
            (FIELD_SIZE.to_string(), self.size.to_string()),
            (FIELD_TIMESTAMP.to_string(), timestamp.to_string()),
        ]
    }
}

pub struct TickLoader;

impl TickLoader {
    pub fn load_from_csv(file_path: &Path) -> Result<Vec<TickRow>, Box<dyn std::error::Error>> {
        let file = File::open(file_path)
            .map_err(|e| format!("Failed to open file {}: {}", file_path.display(), e))?;

        let reader = BufReader::new(file);
        let mut rows = Vec::new();
        let mut errors = 0usize;

        for (line_num, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            let trimmed = line.trim();

            if trimmed.is_empty() || (line_num == 0 && trimmed.starts_with("price")) {
                continue;
            }

            match TickRow::from_csv_line(trimmed, line_num) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    error!("{}", e);
                    errors += 1;
                }
            }
        }

        if rows.is_empty() {
            return Err(format!("No valid ticks in {} ({} errors)", file_path.display(), errors).into());
        }

        if errors > 0 {
            warn!("Loaded {} ticks from {} with {} errors", rows.len(), file_path.display(), errors);
        } else {
            info!("Loaded {} ticks from {}", rows.len(), file_path.display());
        }

        Ok(rows)
    }

    /// Loads every `<SYMBOL>.csv` in a directory.
    pub fn load_multiple_symbols(data_dir: &Path) -> Result<HashMap<String, Vec<TickRow>>, Box<dyn std::error::Error>> {
        let mut symbol_data = HashMap::new();

        for entry in std::fs::read_dir(data_dir)? {
            let path = entry?.path();

            if path.extension() != Some(std::ffi::OsStr::new("csv")) {
                continue;
            }
            if let Some(symbol) = path.file_stem().and_then(|s| s.to_str()) {
                match Self::load_from_csv(&path) {
                    Ok(rows) => {
                        symbol_data.insert(symbol.to_uppercase(), rows);
                    }
                    Err(e) => {
                        error!("Failed to load ticks for symbol {}: {}", symbol, e);
                    }
                }
            }
        }

        if symbol_data.is_empty() {
            return Err(format!("No tick files found in {}", data_dir.display()).into());
        }

        info!("Loaded tick data for {} symbols", symbol_data.len());
        Ok(symbol_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_csv_line() {
        assert_eq!(
            TickRow::from_csv_line("101.25, 30", 0).unwrap(),
            TickRow { price: 101.25, size: 30.0 }
        );
        assert!(TickRow::from_csv_line("101.25", 0).is_err());
        assert!(TickRow::from_csv_line("-1,3", 0).is_err());
    }

    #[test]
    fn test_load_directory_skips_bad_lines() {
        let dir = std::env::temp_dir().join(format!("candle_relay_loader_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut file = File::create(dir.join("aapl.csv")).unwrap();
        writeln!(file, "price,size").unwrap();
        writeln!(file, "100.0,10").unwrap();
        writeln!(file, "garbage").unwrap();
        writeln!(file, "100.5,5").unwrap();
        File::create(dir.join("notes.txt")).unwrap();

        let data = TickLoader::load_multiple_symbols(&dir).unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data["AAPL"].len(), 2);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
