use crate::types::{check_dim, NbarError, NbarResult};
use chrono::{Datelike, Duration, NaiveDate};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Fixed daily processing window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingWindow {
    pub start: NaiveDate,
    pub n_days: usize,
}

impl ProcessingWindow {
    pub fn new(start: NaiveDate, n_days: usize) -> NbarResult<Self> {
        if n_days == 0 {
            return Err(NbarError::Config("Processing window must span at least one day".to_string()));
        }
        Ok(Self { start, n_days })
    }

    /// Window covering one calendar year
    pub fn calendar_year(year: i32) -> NbarResult<Self> {
        let start = NaiveDate::from_ymd_opt(year, 1, 1)
            .ok_or_else(|| NbarError::Config(format!("Invalid year: {}", year)))?;
        let n_days = if NaiveDate::from_ymd_opt(year, 2, 29).is_some() { 366 } else { 365 };
        Self::new(start, n_days)
    }

    /// Exclusive end date
    pub fn end(&self) -> NaiveDate {
        self.start + Duration::days(self.n_days as i64)
    }

    /// Day offset of `date` within the window
    pub fn day_index(&self, date: NaiveDate) -> Option<usize> {
        let offset = (date - self.start).num_days();
        if offset >= 0 && (offset as usize) < self.n_days {
            Some(offset as usize)
        } else {
            None
        }
    }

    /// Day-of-year of every day in the window
    pub fn day_of_year(&self) -> Vec<u32> {
        (0..self.n_days)
            .map(|d| (self.start + Duration::days(d as i64)).ordinal())
            .collect()
    }
}

/// Reduces a sequence of dated observations to one value per day
pub struct DailyCompositor {
    window: ProcessingWindow,
}

impl DailyCompositor {
    pub fn new(window: ProcessingWindow) -> Self {
        Self { window }
    }

    /// Composite [nObs, nBands] observations onto [nDays, nBands]
    ///
    /// Each day takes the mean of the positive values observed on it; days
    /// without any are left at zero. Observations outside the window are
    /// dropped.
    pub fn composite(&self, dates: &[NaiveDate], values: ArrayView2<f64>) -> NbarResult<Array2<f64>> {
        let (n_obs, n_bands) = values.dim();
        check_dim("observation dates", n_obs, dates.len())?;

        let mut sums = Array2::<f64>::zeros((self.window.n_days, n_bands));
        let mut counts = Array2::<u32>::zeros((self.window.n_days, n_bands));
        let mut dropped = 0usize;

        for (i, date) in dates.iter().enumerate() {
            let Some(day) = self.window.day_index(*date) else {
                dropped += 1;
                continue;
            };
            for band in 0..n_bands {
                let v = values[[i, band]];
                if v > 0.0 {
                    sums[[day, band]] += v;
                    counts[[day, band]] += 1;
                }
            }
        }

        if dropped > 0 {
            log::debug!(
                "Dropped {} observations outside {} .. {}",
                dropped,
                self.window.start,
                self.window.end()
            );
        }

        ndarray::Zip::from(&mut sums).and(&counts).for_each(|s, &c| {
            if c > 0 {
                *s /= c as f64;
            }
        });
        Ok(sums)
    }
}
