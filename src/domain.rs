use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

pub const MANIFEST_KEY: &str = "manifests/index.json";

const FORM_ORIGIN: &str = "https://www.transtats.bts.gov";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Quarter(u8);

impl Quarter {
    pub const ALL: [Quarter; 4] = [Quarter(1), Quarter(2), Quarter(3), Quarter(4)];

    pub fn new(value: u8) -> Result<Self, IngestError> {
        if (1..=4).contains(&value) {
            Ok(Self(value))
        } else {
            Err(IngestError::InvalidQuarter(value.to_string()))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Quarter {
    type Error = IngestError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Quarter> for u8 {
    fn from(value: Quarter) -> Self {
        value.0
    }
}

impl fmt::Display for Quarter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Quarter {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let digits = trimmed
            .strip_prefix('Q')
            .or_else(|| trimmed.strip_prefix('q'))
            .unwrap_or(trimmed);
        let parsed = digits
            .parse::<u8>()
            .map_err(|_| IngestError::InvalidQuarter(value.to_string()))?;
        Self::new(parsed).map_err(|_| IngestError::InvalidQuarter(value.to_string()))
    }
}

/// One (year, quarter) scrape-and-ingest job.
///
/// Ordering is row-major: years ascending, quarters 1..=4 within a year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkUnit {
    pub year: i32,
    pub quarter: Quarter,
}

impl WorkUnit {
    pub fn new(year: i32, quarter: u8) -> Result<Self, IngestError> {
        Ok(Self {
            year: validate_year(year)?,
            quarter: Quarter::new(quarter)?,
        })
    }

    pub fn q(&self) -> u8 {
        self.quarter.get()
    }

    pub fn raw_key(&self, filename: &str) -> String {
        format!("{}/Q{}/raw/{filename}", self.year, self.q())
    }

    pub fn curated_prefix(&self) -> String {
        format!("{}/Q{}/curated/", self.year, self.q())
    }

    pub fn curated_key(&self, filename: &str) -> String {
        format!("{}{filename}", self.curated_prefix())
    }

    pub fn marker_key(&self) -> String {
        format!("markers/{}-Q{}.done", self.year, self.q())
    }

    pub fn claim_key(&self) -> String {
        format!("markers/{}-Q{}.claim", self.year, self.q())
    }

    /// Suffix embedded into extracted CSV names, e.g. `__2001Q3`.
    pub fn file_suffix(&self) -> String {
        format!("__{}Q{}", self.year, self.q())
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-Q{}", self.year, self.quarter)
    }
}

impl FromStr for WorkUnit {
    type Err = IngestError;

    /// Accepts `2001Q3`, `2001-Q3` and `2001-3`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (year, quarter) = trimmed
            .split_once(['Q', 'q'])
            .or_else(|| trimmed.split_once('-'))
            .ok_or_else(|| IngestError::InvalidYear(value.to_string()))?;
        let year = year
            .trim_end_matches('-')
            .parse::<i32>()
            .map_err(|_| IngestError::InvalidYear(value.to_string()))?;
        Ok(Self {
            year: validate_year(year)?,
            quarter: quarter.parse()?,
        })
    }
}

pub fn validate_year(year: i32) -> Result<i32, IngestError> {
    if (1900..=9999).contains(&year) {
        Ok(year)
    } else {
        Err(IngestError::InvalidYear(year.to_string()))
    }
}

pub fn units_in_range(start: i32, end: i32) -> impl Iterator<Item = WorkUnit> {
    (start..=end).flat_map(|year| {
        Quarter::ALL
            .into_iter()
            .map(move |quarter| WorkUnit { year, quarter })
    })
}

/// A derived column computed as the product of two numeric source columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricColumn {
    pub name: &'static str,
    pub left: &'static str,
    pub right: &'static str,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Dataset {
    #[default]
    Db1bMarket,
    T100Segment,
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dataset::Db1bMarket => write!(f, "db1b-market"),
            Dataset::T100Segment => write!(f, "t100-segment"),
        }
    }
}

impl FromStr for Dataset {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "db1b-market" | "db1bmarket" | "db1b" => Ok(Dataset::Db1bMarket),
            "t100-segment" | "t100" => Ok(Dataset::T100Segment),
            _ => Err(IngestError::InvalidDataset(value.to_string())),
        }
    }
}

const DB1B_FIELDS: &[&str] = &[
    "YEAR",
    "QUARTER",
    "ORIGIN_AIRPORT_ID",
    "ORIGIN_CITY_MARKET_ID",
    "ORIGIN",
    "DEST_AIRPORT_ID",
    "DEST_CITY_MARKET_ID",
    "DEST",
    "PASSENGERS",
    "MARKET_FARE",
    "MARKET_DISTANCE",
    "MARKET_MILES_FLOWN",
    "NONSTOP_MILES",
];

const T100_FIELDS: &[&str] = &[
    "DEPARTURES_SCHEDULED",
    "DEPARTURES_PERFORMED",
    "PAYLOAD",
    "SEATS",
    "PASSENGERS",
    "FREIGHT",
    "MAIL",
    "DISTANCE",
    "RAMP_TO_RAMP",
    "AIR_TIME",
    "UNIQUE_CARRIER",
    "AIRLINE_ID",
    "UNIQUE_CARRIER_NAME",
    "UNIQUE_CARRIER_ENTITY",
    "REGION",
    "CARRIER",
    "CARRIER_NAME",
    "CARRIER_GROUP",
    "CARRIER_GROUP_NEW",
    "ORIGIN_AIRPORT_ID",
    "ORIGIN_AIRPORT_SEQ_ID",
    "ORIGIN_CITY_MARKET_ID",
    "ORIGIN",
    "ORIGIN_CITY_NAME",
    "ORIGIN_STATE_ABR",
    "ORIGIN_STATE_FIPS",
    "ORIGIN_STATE_NM",
    "ORIGIN_COUNTRY",
    "ORIGIN_COUNTRY_NAME",
    "ORIGIN_WAC",
    "DEST_AIRPORT_ID",
    "DEST_AIRPORT_SEQ_ID",
    "DEST_CITY_MARKET_ID",
    "DEST",
    "DEST_CITY_NAME",
    "DEST_STATE_ABR",
    "DEST_STATE_FIPS",
    "DEST_STATE_NM",
    "DEST_COUNTRY",
    "DEST_COUNTRY_NAME",
    "DEST_WAC",
    "AIRCRAFT_GROUP",
    "AIRCRAFT_TYPE",
    "AIRCRAFT_CONFIG",
    "YEAR",
    "QUARTER",
    "MONTH",
    "DISTANCE_GROUP",
    "CLASS",
    "DATA_SOURCE",
];

const DB1B_METRICS: &[MetricColumn] = &[MetricColumn {
    name: "RPM",
    left: "PASSENGERS",
    right: "MARKET_DISTANCE",
}];

const T100_METRICS: &[MetricColumn] = &[
    MetricColumn {
        name: "ASM",
        left: "SEATS",
        right: "DISTANCE",
    },
    MetricColumn {
        name: "RPM",
        left: "PASSENGERS",
        right: "DISTANCE",
    },
];

impl Dataset {
    pub fn slug(&self) -> &'static str {
        match self {
            Dataset::Db1bMarket => "db1bmarket",
            Dataset::T100Segment => "t100",
        }
    }

    pub fn form_url(&self) -> &'static str {
        match self {
            Dataset::Db1bMarket => {
                "https://www.transtats.bts.gov/DL_SelectFields.aspx?gnoyr_VQ=FHK&QO_fu146_anzr=b4vtv0+n0q+Qr56v0n6v10+f748rB"
            }
            Dataset::T100Segment => {
                "https://www.transtats.bts.gov/DL_SelectFields.aspx?gnoyr_VQ=FMG&QO_fu146_anzr=Nv4+Pn44vr45"
            }
        }
    }

    pub fn form_origin(&self) -> &'static str {
        FORM_ORIGIN
    }

    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            Dataset::Db1bMarket => DB1B_FIELDS,
            Dataset::T100Segment => T100_FIELDS,
        }
    }

    /// Dataset-specific flags sent alongside the field checklist.
    pub fn extra_flags(&self) -> &'static [&'static str] {
        match self {
            Dataset::Db1bMarket => &[],
            Dataset::T100Segment => &["chkAllVars"],
        }
    }

    pub fn metrics(&self) -> &'static [MetricColumn] {
        match self {
            Dataset::Db1bMarket => DB1B_METRICS,
            Dataset::T100Segment => T100_METRICS,
        }
    }

    pub fn default_container(&self) -> &'static str {
        match self {
            Dataset::Db1bMarket => "bts-db1b",
            Dataset::T100Segment => "bts-t100",
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_quarter_forms() {
        assert_eq!("3".parse::<Quarter>().unwrap().get(), 3);
        assert_eq!("Q4".parse::<Quarter>().unwrap().get(), 4);
        assert_matches!("5".parse::<Quarter>(), Err(IngestError::InvalidQuarter(_)));
        assert_matches!("0".parse::<Quarter>(), Err(IngestError::InvalidQuarter(_)));
    }

    #[test]
    fn parse_work_unit() {
        let unit: WorkUnit = "2001Q3".parse().unwrap();
        assert_eq!(unit, WorkUnit::new(2001, 3).unwrap());
        let unit: WorkUnit = "2001-Q3".parse().unwrap();
        assert_eq!(unit.q(), 3);
        let unit: WorkUnit = "1999-2".parse().unwrap();
        assert_eq!((unit.year, unit.q()), (1999, 2));
    }

    #[test]
    fn object_keys() {
        let unit = WorkUnit::new(2001, 3).unwrap();
        assert_eq!(unit.raw_key("a.csv"), "2001/Q3/raw/a.csv");
        assert_eq!(unit.curated_key("a.csv"), "2001/Q3/curated/a.csv");
        assert_eq!(unit.marker_key(), "markers/2001-Q3.done");
        assert_eq!(unit.file_suffix(), "__2001Q3");
        assert_eq!(unit.to_string(), "2001-Q3");
    }

    #[test]
    fn dataset_names() {
        assert_eq!("t100".parse::<Dataset>().unwrap(), Dataset::T100Segment);
        assert_eq!(Dataset::Db1bMarket.to_string(), "db1b-market");
        assert_matches!("nope".parse::<Dataset>(), Err(IngestError::InvalidDataset(_)));
    }
}
