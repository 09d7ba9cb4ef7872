use candle_core::Tensor;
use flow_util::distributions::to_rows;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Open a buffered writer; `stdout`/`stderr` go to the console and a
/// `.gz` extension compresses the output
pub fn open_buf_writer(output_file: &str) -> anyhow::Result<Box<dyn Write>> {
    if output_file.eq_ignore_ascii_case("stdout") {
        return Ok(Box::new(BufWriter::new(std::io::stdout())));
    }
    if output_file.eq_ignore_ascii_case("stderr") {
        return Ok(Box::new(BufWriter::new(std::io::stderr())));
    }

    let file = File::create(output_file)?;
    match Path::new(output_file).extension().and_then(|x| x.to_str()) {
        Some("gz") => {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            Ok(Box::new(BufWriter::new(encoder)))
        }
        _ => Ok(Box::new(BufWriter::new(file))),
    }
}

/// Buffered reader, decompressing `.gz` files
pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let file = File::open(input_file)?;
    match Path::new(input_file).extension().and_then(|x| x.to_str()) {
        Some("gz") => Ok(Box::new(BufReader::new(flate2::read::GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

/// Create the parent directory of `file` if needed
pub fn mkdir(file: &str) -> anyhow::Result<()> {
    if let Some(dir) = Path::new(file).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    Ok(())
}

/// Write an (n, d) tensor as tab-separated rows with a `theta_j` header
pub fn write_samples_tsv(samples: &Tensor, output_file: &str) -> anyhow::Result<()> {
    let rows = to_rows(samples)?;
    let d = samples.dims2()?.1;
    let mut buf = open_buf_writer(output_file)?;

    let header: Vec<String> = (0..d).map(|j| format!("theta_{}", j)).collect();
    writeln!(buf, "{}", header.join("\t"))?;
    for row in rows {
        let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        writeln!(buf, "{}", line.join("\t"))?;
    }
    buf.flush()?;
    Ok(())
}

/// Read back what [`write_samples_tsv`] wrote
pub fn read_samples_tsv(input_file: &str) -> anyhow::Result<Vec<Vec<f32>>> {
    let buf = open_buf_reader(input_file)?;
    let mut rows = vec![];
    for line in buf.lines().skip(1) {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row = line
            .split('\t')
            .map(|v| v.parse::<f32>())
            .collect::<Result<Vec<_>, _>>()?;
        rows.push(row);
    }
    Ok(rows)
}

pub fn write_json<T: Serialize>(value: &T, output_file: &str) -> anyhow::Result<()> {
    let mut buf = open_buf_writer(output_file)?;
    serde_json::to_writer_pretty(&mut buf, value)?;
    writeln!(buf)?;
    buf.flush()?;
    Ok(())
}
