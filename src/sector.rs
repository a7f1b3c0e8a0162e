//! Sector model: names, sector ETFs, sector-aware run thresholds, known ADRs
//! and the 26-week sector momentum adjustment.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::SectorPoints;
use crate::error::Result;
use crate::evaluator::TickerContext;
use crate::fetcher::Fetcher;
use crate::scorer::sector_points;
use crate::types::{PriceSeries, SectorSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sector {
    Technology,
    Healthcare,
    Financials,
    Energy,
    Materials,
    Industrials,
    Communication,
    ConsumerCyclical,
    ConsumerDefensive,
    Utilities,
    RealEstate,
    GoldMiners,
    Unknown,
}

impl Sector {
    /// Every sector with a tracking ETF.
    pub const TRACKED: [Sector; 12] = [
        Sector::Technology,
        Sector::Healthcare,
        Sector::Financials,
        Sector::Energy,
        Sector::Materials,
        Sector::Industrials,
        Sector::Communication,
        Sector::ConsumerCyclical,
        Sector::ConsumerDefensive,
        Sector::Utilities,
        Sector::RealEstate,
        Sector::GoldMiners,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Sector::Technology => "Technology",
            Sector::Healthcare => "Healthcare",
            Sector::Financials => "Financials",
            Sector::Energy => "Energy",
            Sector::Materials => "Materials",
            Sector::Industrials => "Industrials",
            Sector::Communication => "Communication",
            Sector::ConsumerCyclical => "Consumer Cyclical",
            Sector::ConsumerDefensive => "Consumer Defensive",
            Sector::Utilities => "Utilities",
            Sector::RealEstate => "Real Estate",
            Sector::GoldMiners => "Gold Miners",
            Sector::Unknown => "Unknown",
        }
    }

    pub fn etf(&self) -> Option<&'static str> {
        let etf = match self {
            Sector::Technology => "XLK",
            Sector::Healthcare => "XLV",
            Sector::Financials => "XLF",
            Sector::Energy => "XLE",
            Sector::Materials => "XLB",
            Sector::Industrials => "XLI",
            Sector::Communication => "XLC",
            Sector::ConsumerCyclical => "XLY",
            Sector::ConsumerDefensive => "XLP",
            Sector::Utilities => "XLU",
            Sector::RealEstate => "XLRE",
            Sector::GoldMiners => "GDX",
            Sector::Unknown => return None,
        };
        Some(etf)
    }

    /// Minimum prior run % that counts as an institutional run in this sector.
    /// Cyclicals complete full cycles at 120-150%; growth sectors need 300%.
    pub fn run_threshold(&self) -> f64 {
        match self {
            Sector::Utilities | Sector::RealEstate => 120.0,
            Sector::Energy | Sector::Materials | Sector::ConsumerDefensive | Sector::GoldMiners => 150.0,
            Sector::Industrials | Sector::Financials => 200.0,
            Sector::ConsumerCyclical | Sector::Healthcare => 250.0,
            Sector::Communication | Sector::Technology | Sector::Unknown => 300.0,
        }
    }
}

impl From<&str> for Sector {
    /// Accepts the provider and GICS spellings of each sector.
    fn from(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "technology" | "information technology" => Sector::Technology,
            "healthcare" | "health care" => Sector::Healthcare,
            "financials" | "financial services" | "financial" => Sector::Financials,
            "energy" => Sector::Energy,
            "materials" | "basic materials" => Sector::Materials,
            "industrials" => Sector::Industrials,
            "communication" | "communication services" => Sector::Communication,
            "consumer cyclical" | "consumer discretionary" => Sector::ConsumerCyclical,
            "consumer defensive" | "consumer staples" => Sector::ConsumerDefensive,
            "utilities" => Sector::Utilities,
            "real estate" => Sector::RealEstate,
            "gold miners" | "gold" => Sector::GoldMiners,
            _ => Sector::Unknown,
        }
    }
}

impl std::fmt::Display for Sector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

const KNOWN_ADRS: &[&str] = &[
    "BHP", "RIO", "VALE", "SID", "PBR", "CX", "BABA", "JD", "NIO", "XPEV", "LI", "BIDU", "TME",
    "BILI", "IQ", "WB", "GRAB", "SE", "SHOP", "ASML", "TSM", "UMC", "SNY", "AZN", "NVS", "RHHBY",
    "BAYRY", "SAP", "SIEGY", "TM", "HMC", "SONY", "SAN", "BBVA", "IBN", "HDB", "INFY", "WIT", "BP",
    "SHEL", "TOT", "E", "ENI", "EQNR", "STO",
];

pub fn is_adr(ticker: &str) -> bool {
    let upper = ticker.to_ascii_uppercase();
    KNOWN_ADRS.contains(&upper.as_str())
}

/// Trailing return over `weeks` bars, `close[-1] / close[-weeks] - 1`, in %.
/// 0 when the series is too short.
fn trailing_return(series: &PriceSeries, weeks: usize) -> f64 {
    let closes = series.closes();
    if weeks == 0 || closes.len() < weeks {
        return 0.0;
    }
    let then = closes[closes.len() - weeks];
    let now = closes[closes.len() - 1];
    if then <= 0.0 {
        return 0.0;
    }
    (now / then - 1.0) * 100.0
}

/// Sector ETF return minus the benchmark's over `weeks`, rounded to 0.1 points.
/// A short ETF series counts as no relative move.
pub fn relative_return(etf: &PriceSeries, benchmark: &PriceSeries, weeks: usize) -> f64 {
    if etf.len() < weeks {
        return 0.0;
    }
    let rel = trailing_return(etf, weeks) - trailing_return(benchmark, weeks);
    (rel * 10.0).round() / 10.0
}

/// Sector overrides from the sector map plus the current relative returns per sector.
#[derive(Debug, Clone, Default)]
pub struct SectorBook {
    assignments: HashMap<String, Sector>,
    relative: HashMap<Sector, f64>,
    points: SectorPoints,
}

impl SectorBook {
    pub fn new(assignments: HashMap<String, Sector>, points: SectorPoints) -> Self {
        Self {
            assignments,
            relative: HashMap::new(),
            points,
        }
    }

    /// Load a `{ "TICKER": "Sector name" }` JSON map. No path means no overrides.
    pub fn load(path: Option<&str>, points: SectorPoints) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::new(HashMap::new(), points));
        };
        let raw = std::fs::read_to_string(path)?;
        let names: HashMap<String, String> = serde_json::from_str(&raw)?;
        let assignments = names
            .into_iter()
            .map(|(ticker, name)| (ticker.to_ascii_uppercase(), Sector::from(name.as_str())))
            .collect();
        Ok(Self::new(assignments, points))
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    /// Sector pinned by the sector map, if any.
    pub fn assigned(&self, ticker: &str) -> Option<Sector> {
        self.assignments.get(&ticker.to_ascii_uppercase()).copied()
    }

    /// The sector map wins; otherwise ask the provider's company profile.
    pub async fn resolve(&self, fetcher: &Fetcher, ticker: &str) -> Sector {
        match self.assigned(ticker) {
            Some(sector) => sector,
            None => fetcher.sector(ticker).await,
        }
    }

    pub fn set_relative_returns(&mut self, relative: HashMap<Sector, f64>) {
        self.relative = relative;
    }

    pub fn snapshot(&self, sector: Sector) -> SectorSnapshot {
        let relative_return_pct = self.relative.get(&sector).copied();
        SectorSnapshot {
            name: sector.name().to_string(),
            etf: sector.etf().map(str::to_string),
            relative_return_pct,
            points: relative_return_pct.map_or(0, |r| sector_points(r, &self.points)),
        }
    }

    /// Everything the evaluator needs to know about a ticker beyond its prices.
    pub fn context_for(&self, ticker: &str, sector: Sector) -> TickerContext {
        TickerContext {
            is_adr: is_adr(ticker),
            run_threshold: Some(sector.run_threshold()),
            sector: self.snapshot(sector),
        }
    }
}
