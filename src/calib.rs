// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Calibration data handed to the algorithms at prepare() time. Parsing the
//! on-disk tuning files is the job of a CalibSource implementation; this
//! module only caches and sanity-checks what the source produces.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use canonical_error::{CanonicalError, invalid_argument_error, not_found_error};
use log::{info, warn};

use crate::algo_type::AlgoType;

/// Tuning table for one table-driven module, indexed by ISO.
#[derive(Clone, Debug, PartialEq)]
pub struct IsoTable {
    /// Ascending ISO sample points.
    pub iso: Vec<u32>,
    /// Module strength at each ISO sample point.
    pub strength: Vec<f32>,
}

impl IsoTable {
    pub fn constant(strength: f32) -> Self {
        IsoTable{iso: vec![50], strength: vec![strength]}
    }

    /// Piecewise linear interpolation, clamped at both ends.
    pub fn interpolate(&self, iso: u32) -> f32 {
        let n = self.iso.len().min(self.strength.len());
        if n == 0 {
            return 0.0;
        }
        if iso <= self.iso[0] {
            return self.strength[0];
        }
        for i in 1..n {
            if iso <= self.iso[i] {
                let (x0, x1) = (self.iso[i - 1] as f32, self.iso[i] as f32);
                let (y0, y1) = (self.strength[i - 1], self.strength[i]);
                return y0 + (y1 - y0) * (iso as f32 - x0) / (x1 - x0);
            }
        }
        self.strength[n - 1]
    }
}

/// Parsed calibration database for one sensor/lens module.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibDb {
    pub name: String,

    /// Checksum recorded by the tuning tool. Compared against
    /// compute_checksum() at load time.
    pub checksum: u32,

    /// Mean luma the exposure algorithm converges to.
    pub ae_target_luma: f32,

    /// (R, B) gains used before the first white balance result.
    pub default_wb_gains: (f32, f32),

    /// Row-major 3x3 color correction matrix at the reference illuminant.
    pub ccm: [f32; 9],

    /// Lens shading gain grid, row major, as 1/1024 fixed point.
    pub lsc_table: Vec<u16>,

    pub tuning: BTreeMap<AlgoType, IsoTable>,
}

impl Default for CalibDb {
    fn default() -> Self {
        let mut db = CalibDb {
            name: "default".to_string(),
            checksum: 0,
            ae_target_luma: 50.0,
            default_wb_gains: (1.8, 1.6),
            ccm: [1.0, 0.0, 0.0,
                  0.0, 1.0, 0.0,
                  0.0, 0.0, 1.0],
            lsc_table: vec![1024; 17 * 17],
            tuning: BTreeMap::new(),
        };
        db.tuning.insert(AlgoType::Anr, IsoTable{
            iso: vec![50, 800, 6400], strength: vec![0.1, 0.5, 1.0]});
        db.tuning.insert(AlgoType::Asharp, IsoTable{
            iso: vec![50, 800, 6400], strength: vec![1.0, 0.6, 0.2]});
        db.checksum = db.compute_checksum();
        db
    }
}

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1a(mut hash: u32, bytes: &[u8]) -> u32 {
    for b in bytes {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl CalibDb {
    /// FNV-1a over the tuning payload (everything except name and checksum).
    pub fn compute_checksum(&self) -> u32 {
        let mut h = FNV_OFFSET;
        h = fnv1a(h, &self.ae_target_luma.to_le_bytes());
        h = fnv1a(h, &self.default_wb_gains.0.to_le_bytes());
        h = fnv1a(h, &self.default_wb_gains.1.to_le_bytes());
        for c in &self.ccm {
            h = fnv1a(h, &c.to_le_bytes());
        }
        for v in &self.lsc_table {
            h = fnv1a(h, &v.to_le_bytes());
        }
        for (algo_type, table) in &self.tuning {
            h = fnv1a(h, algo_type.name().as_bytes());
            for iso in &table.iso {
                h = fnv1a(h, &iso.to_le_bytes());
            }
            for s in &table.strength {
                h = fnv1a(h, &s.to_le_bytes());
            }
        }
        h
    }

    pub fn checksum_matches(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Tuning table for `algo_type`, or a neutral constant table.
    pub fn tuning_for(&self, algo_type: AlgoType) -> IsoTable {
        self.tuning.get(&algo_type).cloned().unwrap_or_else(|| IsoTable::constant(1.0))
    }

    /// Rejects databases that no algorithm could use.
    pub fn validate(&self) -> Result<(), CanonicalError> {
        if !(self.ae_target_luma > 0.0 && self.ae_target_luma < 255.0) {
            return Err(invalid_argument_error(
                format!("calib {}: AE target luma {} out of range",
                        self.name, self.ae_target_luma).as_str()));
        }
        let (r, b) = self.default_wb_gains;
        if r <= 0.0 || b <= 0.0 {
            return Err(invalid_argument_error(
                format!("calib {}: default WB gains must be positive", self.name).as_str()));
        }
        for (algo_type, table) in &self.tuning {
            if table.iso.len() != table.strength.len() || table.iso.is_empty() {
                return Err(invalid_argument_error(
                    format!("calib {}: malformed {} table", self.name, algo_type).as_str()));
            }
            if !table.iso.windows(2).all(|w| w[0] < w[1]) {
                return Err(invalid_argument_error(
                    format!("calib {}: {} ISO points not strictly ascending",
                            self.name, algo_type).as_str()));
            }
        }
        Ok(())
    }
}

/// Produces parsed calibration databases, e.g. from tuning XML or a binary
/// cache file.
pub trait CalibSource {
    fn load(&self, name: &str) -> Result<CalibDb, CanonicalError>;
}

/// Source that only knows a fixed set of in-memory databases.
#[derive(Default)]
pub struct StaticCalibSource {
    dbs: HashMap<String, CalibDb>,
}

impl StaticCalibSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, db: CalibDb) -> Self {
        self.dbs.insert(db.name.clone(), db);
        self
    }
}

impl CalibSource for StaticCalibSource {
    fn load(&self, name: &str) -> Result<CalibDb, CanonicalError> {
        match self.dbs.get(name) {
            Some(db) => Ok(db.clone()),
            None => Err(not_found_error(
                format!("no calibration named {}", name).as_str())),
        }
    }
}

/// Owns the parsed calibration databases. Each engine is handed a store at
/// construction; there is no process-wide cache.
#[derive(Default)]
pub struct CalibStore {
    loaded: Mutex<HashMap<String, Arc<CalibDb>>>,
}

impl CalibStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached database for `name`, loading it from `source` on
    /// first use. A checksum mismatch is only a warning; a load or validation
    /// failure is returned to the caller.
    pub fn load(&self, name: &str, source: &dyn CalibSource)
                -> Result<Arc<CalibDb>, CanonicalError> {
        if let Some(db) = self.loaded.lock().unwrap().get(name) {
            return Ok(db.clone());
        }
        let db = source.load(name)?;
        db.validate()?;
        if !db.checksum_matches() {
            warn!("calib {}: checksum {:#010x} does not match contents ({:#010x})",
                  name, db.checksum, db.compute_checksum());
        }
        info!("Loaded calibration {}", name);
        let db = Arc::new(db);
        self.loaded.lock().unwrap().insert(name.to_string(), db.clone());
        Ok(db)
    }

    /// Inserts an already parsed database, replacing any cached one of the
    /// same name.
    pub fn insert(&self, db: CalibDb) -> Result<Arc<CalibDb>, CanonicalError> {
        db.validate()?;
        if !db.checksum_matches() {
            warn!("calib {}: checksum mismatch", db.name);
        }
        let db = Arc::new(db);
        self.loaded.lock().unwrap().insert(db.name.clone(), db.clone());
        Ok(db)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CalibDb>> {
        self.loaded.lock().unwrap().get(name).cloned()
    }
}
