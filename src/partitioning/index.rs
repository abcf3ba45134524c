//! Ordered point index with range consumption.

use crate::types::Point;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included, Unbounded};

/// Entries keyed by ring point. Several entries may share a point.
#[derive(Debug)]
pub struct PointIndex<T> {
    entries: BTreeMap<Point, Vec<T>>,
    len: usize,
}

impl<T> Default for PointIndex<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            len: 0,
        }
    }
}

impl<T> PointIndex<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries across all points.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Add an entry at `point`.
    pub fn insert(&mut self, point: Point, value: T) {
        self.entries.entry(point).or_default().push(value);
        self.len += 1;
    }

    /// Remove the first entry at `point` matching `pred`.
    pub fn remove_where<F>(&mut self, point: Point, mut pred: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let bucket = self.entries.get_mut(&point)?;
        let pos = bucket.iter().position(|v| pred(v))?;
        let value = bucket.remove(pos);
        if bucket.is_empty() {
            self.entries.remove(&point);
        }
        self.len -= 1;
        Some(value)
    }

    /// Entries stored at exactly `point`.
    pub fn get(&self, point: Point) -> &[T] {
        self.entries.get(&point).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Remove and return every entry whose point lies in `(start, end]`.
    ///
    /// Entries come back in clockwise order starting just after `start`, so a
    /// wrapping range yields the high points before the low ones. When
    /// `start == end` the range is the whole ring.
    pub fn consume_range(&mut self, start: Point, end: Point) -> Vec<(Point, T)> {
        let mut points: Vec<Point> = Vec::new();
        if start < end {
            points.extend(self.entries.range((Excluded(start), Included(end))).map(|(p, _)| *p));
        } else {
            points.extend(self.entries.range((Excluded(start), Unbounded)).map(|(p, _)| *p));
            points.extend(self.entries.range(..=end).map(|(p, _)| *p));
        }

        let mut consumed = Vec::new();
        for point in points {
            if let Some(bucket) = self.entries.remove(&point) {
                self.len -= bucket.len();
                consumed.extend(bucket.into_iter().map(|v| (point, v)));
            }
        }
        consumed
    }

    /// Remove every entry in ascending point order.
    pub fn drain(&mut self) -> Vec<(Point, T)> {
        self.len = 0;
        std::mem::take(&mut self.entries)
            .into_iter()
            .flat_map(|(point, bucket)| bucket.into_iter().map(move |v| (point, v)))
            .collect()
    }
}
