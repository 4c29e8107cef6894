// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod c2;
pub mod codec;
pub mod component;
pub mod decoder;
pub mod device;
pub mod pool;
pub mod worker;

use std::fmt;

/// A frame size in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A rectangle within a coded frame, used for visible-area cropping.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether `self` lies entirely within a frame of `size` anchored at the
    /// origin.
    pub fn fits_in(&self, size: Resolution) -> bool {
        self.left >= 0
            && self.top >= 0
            && self.left as i64 + i64::from(self.width) <= i64::from(size.width)
            && self.top as i64 + i64::from(self.height) <= i64::from(size.height)
    }
}

impl From<Resolution> for Rect {
    fn from(size: Resolution) -> Self {
        Self { left: 0, top: 0, width: size.width, height: size.height }
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}) {}x{}", self.left, self.top, self.width, self.height)
    }
}

/// Compressed formats the decode component accepts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    Vp8,
    Vp9,
    Hevc,
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoCodec::H264 => write!(f, "H264"),
            VideoCodec::Vp8 => write!(f, "VP8"),
            VideoCodec::Vp9 => write!(f, "VP9"),
            VideoCodec::Hevc => write!(f, "HEVC"),
        }
    }
}
