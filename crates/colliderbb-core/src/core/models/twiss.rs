use super::table::{
    NameIndex, TableError, create_file, read_file, split_commented_header, write_commented_header,
};
use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Read, Write};
use std::path::Path;

/// Global quantities of a periodic optics solution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TwissSummary {
    pub qx: f64,
    pub qy: f64,
    #[serde(default)]
    pub dqx: f64,
    #[serde(default)]
    pub dqy: f64,
    #[serde(default)]
    pub c_minus: f64,
    pub circumference: f64,
    /// Relativistic factors of the particle on the closed orbit.
    pub beta0: f64,
    pub gamma0: f64,
    /// Longitudinal position of the particle the orbit was computed for, when off centre.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zeta0: Option<f64>,
}

/// Optics functions and closed orbit at the exit of one element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwissRow {
    pub name: String,
    pub s: f64,
    pub x: f64,
    pub px: f64,
    pub y: f64,
    pub py: f64,
    pub zeta: f64,
    pub ptau: f64,
    pub betx: f64,
    pub bety: f64,
    pub alfx: f64,
    pub alfy: f64,
    pub gamx: f64,
    pub gamy: f64,
    pub dx: f64,
    pub dy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwissColumn {
    S,
    X,
    Px,
    Y,
    Py,
    Zeta,
    Ptau,
    Betx,
    Bety,
    Alfx,
    Alfy,
    Gamx,
    Gamy,
    Dx,
    Dy,
}

impl TwissColumn {
    pub fn name(self) -> &'static str {
        match self {
            TwissColumn::S => "s",
            TwissColumn::X => "x",
            TwissColumn::Px => "px",
            TwissColumn::Y => "y",
            TwissColumn::Py => "py",
            TwissColumn::Zeta => "zeta",
            TwissColumn::Ptau => "ptau",
            TwissColumn::Betx => "betx",
            TwissColumn::Bety => "bety",
            TwissColumn::Alfx => "alfx",
            TwissColumn::Alfy => "alfy",
            TwissColumn::Gamx => "gamx",
            TwissColumn::Gamy => "gamy",
            TwissColumn::Dx => "dx",
            TwissColumn::Dy => "dy",
        }
    }

    pub fn of(self, row: &TwissRow) -> f64 {
        match self {
            TwissColumn::S => row.s,
            TwissColumn::X => row.x,
            TwissColumn::Px => row.px,
            TwissColumn::Y => row.y,
            TwissColumn::Py => row.py,
            TwissColumn::Zeta => row.zeta,
            TwissColumn::Ptau => row.ptau,
            TwissColumn::Betx => row.betx,
            TwissColumn::Bety => row.bety,
            TwissColumn::Alfx => row.alfx,
            TwissColumn::Alfy => row.alfy,
            TwissColumn::Gamx => row.gamx,
            TwissColumn::Gamy => row.gamy,
            TwissColumn::Dx => row.dx,
            TwissColumn::Dy => row.dy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TwissTableData {
    summary: TwissSummary,
    rows: Vec<TwissRow>,
}

// Column set accepted from CSV exports; the gamma functions may be omitted.
#[derive(Debug, Deserialize)]
struct CsvTwissRow {
    name: String,
    s: f64,
    x: f64,
    px: f64,
    y: f64,
    py: f64,
    #[serde(default)]
    zeta: f64,
    #[serde(default)]
    ptau: f64,
    betx: f64,
    bety: f64,
    alfx: f64,
    alfy: f64,
    gamx: Option<f64>,
    gamy: Option<f64>,
    #[serde(default)]
    dx: f64,
    #[serde(default)]
    dy: f64,
}

impl From<CsvTwissRow> for TwissRow {
    fn from(r: CsvTwissRow) -> Self {
        Self {
            gamx: r.gamx.unwrap_or((1.0 + r.alfx * r.alfx) / r.betx),
            gamy: r.gamy.unwrap_or((1.0 + r.alfy * r.alfy) / r.bety),
            name: r.name,
            s: r.s,
            x: r.x,
            px: r.px,
            y: r.y,
            py: r.py,
            zeta: r.zeta,
            ptau: r.ptau,
            betx: r.betx,
            bety: r.bety,
            alfx: r.alfx,
            alfy: r.alfy,
            dx: r.dx,
            dy: r.dy,
        }
    }
}

/// Element-by-element optics of one line, as returned by the optics service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "TwissTableData", into = "TwissTableData")]
pub struct TwissTable {
    summary: TwissSummary,
    rows: Vec<TwissRow>,
    index: NameIndex,
}

impl From<TwissTableData> for TwissTable {
    fn from(data: TwissTableData) -> Self {
        Self::new(data.summary, data.rows)
    }
}

impl From<TwissTable> for TwissTableData {
    fn from(table: TwissTable) -> Self {
        Self {
            summary: table.summary,
            rows: table.rows,
        }
    }
}

impl TwissTable {
    pub fn new(summary: TwissSummary, rows: Vec<TwissRow>) -> Self {
        let index = NameIndex::build(rows.iter().map(|r| r.name.as_str()));
        Self {
            summary,
            rows,
            index,
        }
    }

    pub fn summary(&self) -> &TwissSummary {
        &self.summary
    }

    pub fn rows(&self) -> &[TwissRow] {
        &self.rows
    }

    pub fn circumference(&self) -> f64 {
        self.summary.circumference
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.get(name).is_some()
    }

    pub fn row(&self, name: &str) -> Result<&TwissRow, TableError> {
        self.index
            .get(name)
            .map(|i| &self.rows[i])
            .ok_or_else(|| TableError::MissingElement {
                table: "twiss",
                element: name.to_string(),
            })
    }

    pub fn value(&self, column: TwissColumn, name: &str) -> Result<f64, TableError> {
        self.row(name).map(|r| column.of(r))
    }

    /// The same optics seen by a particle travelling in the opposite direction.
    ///
    /// Rows are reversed, `s` is measured from the other end, and the
    /// coordinates that flip with the direction of motion change sign.
    pub fn reverse(&self) -> TwissTable {
        let circumference = self.summary.circumference;
        let rows = self
            .rows
            .iter()
            .rev()
            .map(|r| TwissRow {
                name: r.name.clone(),
                s: circumference - r.s,
                x: -r.x,
                px: r.px,
                y: r.y,
                py: -r.py,
                zeta: -r.zeta,
                ptau: r.ptau,
                betx: r.betx,
                bety: r.bety,
                alfx: -r.alfx,
                alfy: -r.alfy,
                gamx: r.gamx,
                gamy: r.gamy,
                dx: -r.dx,
                dy: r.dy,
            })
            .collect();
        TwissTable::new(self.summary, rows)
    }

    /// Reads a CSV export: leading `# key = value` lines hold the summary,
    /// followed by a header row and one row per element.
    pub fn read_csv(mut reader: impl Read) -> Result<Self, TableError> {
        let mut content = String::new();
        reader.read_to_string(&mut content).map_err(|e| TableError::Io {
            path: "<reader>".to_string(),
            source: e,
        })?;
        Self::parse_csv(&content)
    }

    pub fn read_csv_path(path: &Path) -> Result<Self, TableError> {
        Self::parse_csv(&read_file(path)?)
    }

    /// Writes the table in the layout read by [`TwissTable::read_csv`].
    pub fn write_csv(&self, mut writer: impl Write) -> Result<(), TableError> {
        write_commented_header(&mut writer, &toml::to_string(&self.summary)?)?;
        let mut csv_writer = csv::Writer::from_writer(writer);
        for row in &self.rows {
            csv_writer.serialize(row)?;
        }
        csv_writer.flush().map_err(|e| TableError::Io {
            path: "<writer>".to_string(),
            source: e,
        })
    }

    pub fn write_csv_path(&self, path: &Path) -> Result<(), TableError> {
        self.write_csv(BufWriter::new(create_file(path)?))
    }

    fn parse_csv(content: &str) -> Result<Self, TableError> {
        let (header, body) = split_commented_header(content);
        let summary: TwissSummary = toml::from_str(&header)?;

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(body.as_bytes());
        let rows = reader
            .deserialize::<CsvTwissRow>()
            .map(|r| r.map(TwissRow::from))
            .collect::<Result<Vec<_>, _>>()?;
        if rows.is_empty() {
            return Err(TableError::Empty);
        }
        Ok(Self::new(summary, rows))
    }
}
