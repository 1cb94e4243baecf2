use crate::types::GridConfig;
use ndarray::{Array3, ArrayView2, Axis};
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisibilityError {
    #[error("I/O error on gridded visibility file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed gridded visibility file at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("CSV error in gridded visibility file: {0}")]
    Csv(#[from] csv::Error),

    #[error("Inconsistent gridded visibility shape: {0}")]
    Shape(String),

    #[error("Negative or non-finite weight {weight} at plane {plane}, v={v}, u={u}")]
    NegativeWeight {
        plane: usize,
        v: usize,
        u: usize,
        weight: f64,
    },
}

/// Location of one gridded visibility sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SampleIndex {
    pub plane: usize,
    pub v: usize,
    pub u: usize,
}

/// Gridded complex visibilities and weights, one `(nv, nu)` array set per w-plane.
///
/// Arrays are indexed `[plane, v, u]`. A cell with strictly positive weight is
/// a sample; everything else is empty grid.
#[derive(Debug, Clone, PartialEq)]
pub struct GriddedVisibilityStore {
    real: Array3<f64>,
    imag: Array3<f64>,
    weight: Array3<f64>,
    grid: GridConfig,
}

impl GriddedVisibilityStore {
    pub fn new(
        real: Array3<f64>,
        imag: Array3<f64>,
        weight: Array3<f64>,
        grid: GridConfig,
    ) -> Result<Self, VisibilityError> {
        if real.dim() != imag.dim() || real.dim() != weight.dim() {
            return Err(VisibilityError::Shape(format!(
                "real {:?}, imag {:?} and weight {:?} must agree",
                real.dim(),
                imag.dim(),
                weight.dim()
            )));
        }
        let (_, nv, nu) = real.dim();
        if nv != grid.nv || nu != grid.nu {
            return Err(VisibilityError::Shape(format!(
                "plane shape ({nv}, {nu}) does not match grid ({}, {})",
                grid.nv, grid.nu
            )));
        }
        for ((plane, v, u), &w) in weight.indexed_iter() {
            if !(w.is_finite() && w >= 0.0) {
                return Err(VisibilityError::NegativeWeight {
                    plane,
                    v,
                    u,
                    weight: w,
                });
            }
        }
        Ok(Self {
            real,
            imag,
            weight,
            grid,
        })
    }

    pub fn grid(&self) -> &GridConfig {
        &self.grid
    }

    pub fn num_planes(&self) -> usize {
        self.real.len_of(Axis(0))
    }

    pub fn real_plane(&self, plane: usize) -> ArrayView2<'_, f64> {
        self.real.index_axis(Axis(0), plane)
    }

    pub fn imag_plane(&self, plane: usize) -> ArrayView2<'_, f64> {
        self.imag.index_axis(Axis(0), plane)
    }

    pub fn weight_plane(&self, plane: usize) -> ArrayView2<'_, f64> {
        self.weight.index_axis(Axis(0), plane)
    }

    pub fn value(&self, at: SampleIndex) -> (f64, f64) {
        let idx = [at.plane, at.v, at.u];
        (self.real[idx], self.imag[idx])
    }

    pub fn weight_at(&self, at: SampleIndex) -> f64 {
        self.weight[[at.plane, at.v, at.u]]
    }

    /// Samples in row-major `(plane, v, u)` order.
    pub fn sample_locations(&self) -> Vec<SampleIndex> {
        self.weight
            .indexed_iter()
            .filter(|&(_, &w)| w > 0.0)
            .map(|((plane, v, u), _)| SampleIndex { plane, v, u })
            .collect()
    }

    pub fn num_samples(&self) -> usize {
        self.weight.iter().filter(|&&w| w > 0.0).count()
    }

    /// Copy of the store with the given cells emptied (value and weight zeroed).
    pub fn without_samples(&self, removed: &[SampleIndex]) -> Self {
        let mut out = self.clone();
        for at in removed {
            let idx = [at.plane, at.v, at.u];
            out.real[idx] = 0.0;
            out.imag[idx] = 0.0;
            out.weight[idx] = 0.0;
        }
        out
    }

    /// Read a single-plane store from the plain-text interchange format.
    ///
    /// ```text
    /// M = <number of samples>
    /// NX = <nu>
    /// NY = <nv>
    ///
    /// u, v, y_r, y_i, noise_std_dev
    ///
    /// <u>, <v>, <re>, <im>, <noise>
    /// ```
    pub fn import_text(
        path: &Path,
        cellu: f64,
        cellv: f64,
    ) -> Result<Self, VisibilityError> {
        let mut reader = BufReader::new(fs::File::open(path)?);
        let mut line = 0usize;

        let m = parse_header(&preamble_line(&mut reader, &mut line)?, "M", line)?;
        let nx = parse_header(&preamble_line(&mut reader, &mut line)?, "NX", line)?;
        let ny = parse_header(&preamble_line(&mut reader, &mut line)?, "NY", line)?;
        // Blank, column names, blank.
        for _ in 0..3 {
            preamble_line(&mut reader, &mut line)?;
        }
        let preamble = line;

        let shape = (1, ny, nx);
        let mut real = Array3::<f64>::zeros(shape);
        let mut imag = Array3::<f64>::zeros(shape);
        let mut weight = Array3::<f64>::zeros(shape);

        let mut rows = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let mut record = csv::StringRecord::new();
        let mut count = 0usize;
        while rows
            .read_record(&mut record)
            .map_err(|e| csv_read_error(e, preamble))?
        {
            let ln = preamble + record.position().map_or(0, |p| p.line() as usize);
            if count == m {
                return Err(VisibilityError::Parse {
                    line: ln,
                    message: format!("more rows than the {m} announced by the header"),
                });
            }
            if record.len() != 5 {
                return Err(VisibilityError::Parse {
                    line: ln,
                    message: format!("expected 5 fields, found {}", record.len()),
                });
            }
            let (u, v, re, im, noise): (usize, usize, f64, f64, f64) =
                record.deserialize(None).map_err(|e| VisibilityError::Parse {
                    line: ln,
                    message: e.to_string(),
                })?;
            if u >= nx || v >= ny {
                return Err(VisibilityError::Parse {
                    line: ln,
                    message: format!("cell ({u}, {v}) lies outside a {nx}x{ny} grid"),
                });
            }
            if !(noise.is_finite() && noise > 0.0) {
                return Err(VisibilityError::Parse {
                    line: ln,
                    message: format!("noise standard deviation must be positive, got {noise}"),
                });
            }
            real[[0, v, u]] = re;
            imag[[0, v, u]] = im;
            weight[[0, v, u]] = 1.0 / (noise * noise);
            count += 1;
        }
        if count != m {
            return Err(VisibilityError::Parse {
                line: preamble + count,
                message: format!("header announces {m} rows but the file has {count}"),
            });
        }

        let grid = GridConfig::new(cellu, cellv, nx, ny);
        log::debug!(
            "[CV] imported {} gridded samples ({}x{}) from {}",
            m,
            nx,
            ny,
            path.display()
        );
        Self::new(real, imag, weight, grid)
    }

    /// Write the first plane in the format read by [`Self::import_text`].
    pub fn export_text(&self, path: &Path) -> Result<(), VisibilityError> {
        if self.num_planes() != 1 {
            return Err(VisibilityError::Shape(format!(
                "text export supports a single plane, store has {}",
                self.num_planes()
            )));
        }
        let samples = self.sample_locations();
        let mut out = BufWriter::new(fs::File::create(path)?);
        writeln!(out, "M = {}", samples.len())?;
        writeln!(out, "NX = {}", self.grid.nu)?;
        writeln!(out, "NY = {}", self.grid.nv)?;
        writeln!(out)?;
        writeln!(out, "u, v, y_r, y_i, noise_std_dev")?;
        writeln!(out)?;

        let mut rows = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(out);
        for at in samples {
            let (re, im) = self.value(at);
            let noise = 1.0 / self.weight_at(at).sqrt();
            rows.serialize((at.u, at.v, re, im, noise))?;
        }
        rows.flush()?;
        Ok(())
    }
}

fn preamble_line<R: BufRead>(reader: &mut R, line: &mut usize) -> Result<String, VisibilityError> {
    let mut text = String::new();
    if reader.read_line(&mut text)? == 0 {
        return Err(VisibilityError::Parse {
            line: *line + 1,
            message: "unexpected end of file in header".to_string(),
        });
    }
    *line += 1;
    Ok(text.trim_end().to_string())
}

fn csv_read_error(error: csv::Error, preamble: usize) -> VisibilityError {
    if error.is_io_error() {
        return VisibilityError::Csv(error);
    }
    let line = error
        .position()
        .map_or(preamble, |p| preamble + p.line() as usize);
    VisibilityError::Parse {
        line,
        message: error.to_string(),
    }
}

fn parse_header(text: &str, key: &str, line: usize) -> Result<usize, VisibilityError> {
    let (name, value) = text.split_once('=').ok_or_else(|| VisibilityError::Parse {
        line,
        message: format!("expected '{key} = <value>'"),
    })?;
    if name.trim() != key {
        return Err(VisibilityError::Parse {
            line,
            message: format!("expected header '{key}', found '{}'", name.trim()),
        });
    }
    let value = value.trim();
    value.parse::<usize>().map_err(|e| VisibilityError::Parse {
        line,
        message: format!("cannot parse '{value}': {e}"),
    })
}
