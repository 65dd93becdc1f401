use super::table::{
    NameIndex, TableError, create_file, read_file, split_commented_header, write_commented_header,
};
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Global position of the reference trajectory at one element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyRow {
    pub name: String,
    pub s: f64,
    #[serde(rename = "X")]
    pub x: f64,
    #[serde(rename = "Y")]
    pub y: f64,
    #[serde(rename = "Z")]
    pub z: f64,
}

impl SurveyRow {
    pub fn position(&self) -> Point3<f64> {
        Point3::new(self.x, self.y, self.z)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SurveyHeader {
    #[serde(default)]
    length: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SurveyTableData {
    length: f64,
    rows: Vec<SurveyRow>,
}

/// Survey of one line, expressed in a frame centred on its starting element.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "SurveyTableData", into = "SurveyTableData")]
pub struct SurveyTable {
    length: f64,
    rows: Vec<SurveyRow>,
    index: NameIndex,
}

impl From<SurveyTableData> for SurveyTable {
    fn from(data: SurveyTableData) -> Self {
        Self::new(data.length, data.rows)
    }
}

impl From<SurveyTable> for SurveyTableData {
    fn from(table: SurveyTable) -> Self {
        Self {
            length: table.length,
            rows: table.rows,
        }
    }
}

impl SurveyTable {
    pub fn new(length: f64, rows: Vec<SurveyRow>) -> Self {
        let index = NameIndex::build(rows.iter().map(|r| r.name.as_str()));
        Self {
            length,
            rows,
            index,
        }
    }

    pub fn rows(&self) -> &[SurveyRow] {
        &self.rows
    }

    pub fn length(&self) -> f64 {
        self.length
    }

    pub fn row(&self, name: &str) -> Result<&SurveyRow, TableError> {
        self.index
            .get(name)
            .map(|i| &self.rows[i])
            .ok_or_else(|| TableError::MissingElement {
                table: "survey",
                element: name.to_string(),
            })
    }

    pub fn big_x(&self, name: &str) -> Result<f64, TableError> {
        self.row(name).map(|r| r.x)
    }

    pub fn big_y(&self, name: &str) -> Result<f64, TableError> {
        self.row(name).map(|r| r.y)
    }

    /// Survey seen from the opposite direction of motion: the horizontal axis flips.
    pub fn reverse(&self) -> SurveyTable {
        let rows = self
            .rows
            .iter()
            .rev()
            .map(|r| SurveyRow {
                name: r.name.clone(),
                s: self.length - r.s,
                x: -r.x,
                y: r.y,
                z: r.z,
            })
            .collect();
        SurveyTable::new(self.length, rows)
    }

    /// Reads a CSV export with columns `name, s, X, Y, Z`. A `# length = ...` header line
    /// gives the line length; without it the largest `s` is used.
    pub fn read_csv_path(path: &Path) -> Result<Self, TableError> {
        let (header, body) = split_commented_header(&read_file(path)?);
        let header: SurveyHeader = toml::from_str(&header)?;
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(body.as_bytes());
        let rows = reader
            .deserialize::<SurveyRow>()
            .collect::<Result<Vec<_>, _>>()?;
        let longest = rows
            .iter()
            .map(|r| r.s)
            .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.max(s))))
            .ok_or(TableError::Empty)?;
        Ok(Self::new(header.length.unwrap_or(longest), rows))
    }

    pub fn write_csv(&self, mut writer: impl Write) -> Result<(), TableError> {
        let header = SurveyHeader {
            length: Some(self.length),
        };
        write_commented_header(&mut writer, &toml::to_string(&header)?)?;
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn table() -> SurveyTable {
        SurveyTable::new(
            100.0,
            vec![
                SurveyRow {
                    name: "ip1".into(),
                    s: 0.0,
                    x: 0.0,
                    y: 0.0,
                    z: 0.0,
                },
                SurveyRow {
                    name: "bb_lr.r1b1_01".into(),
                    s: 3.75,
                    x: 0.097,
                    y: 0.001,
                    z: 3.75,
                },
            ],
        )
    }

    #[test]
    fn reverse_mirrors_horizontal_axis() {
        let reversed = table().reverse();
        assert_eq!(reversed.rows()[0].name, "bb_lr.r1b1_01");
        assert_eq!(reversed.big_x("bb_lr.r1b1_01").unwrap(), -0.097);
        assert_eq!(reversed.big_y("bb_lr.r1b1_01").unwrap(), 0.001);
        assert_eq!(reversed.row("ip1").unwrap().s, 100.0);
    }

    #[test]
    fn missing_element_is_reported() {
        let err = table().row("ip5").unwrap_err();
        assert_eq!(err.to_string(), "Element 'ip5' not found in survey table");
    }

    #[test]
    fn csv_without_length_uses_largest_s() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "name,s,X,Y,Z").unwrap();
        writeln!(file, "ip1,0.0,0.0,0.0,0.0").unwrap();
        writeln!(file, "mb.1,14.3,0.1,0.0,14.29").unwrap();

        let survey = SurveyTable::read_csv_path(file.path()).unwrap();
        assert_eq!(survey.length(), 14.3);
        assert_eq!(survey.row("mb.1").unwrap().position(), Point3::new(0.1, 0.0, 14.29));
    }

    #[test]
    fn written_survey_keeps_line_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("survey_lhcb1_ip1.csv");
        table().write_csv_path(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# length = 100.0\n"));
        assert!(text.contains("name,s,X,Y,Z"));
        let back = SurveyTable::read_csv_path(&path).unwrap();
        assert_eq!(back.length(), 100.0);
        assert_eq!(back.rows(), table().rows());
        assert_eq!(back.reverse().row("ip1").unwrap().s, 100.0);
    }
}
