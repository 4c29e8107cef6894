// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Extraction of the coded color description from an H.264 bitstream.
//!
//! Codec2 expects the component to parse color aspects out of the CSD buffer
//! so the framework can reconcile them with the values the client requested.
//! Only the SPS fields on the path to `colour_description` are interpreted,
//! everything else is skipped at the syntax level.

use std::io::Cursor;

use anyhow::anyhow;
use bytes::Buf;
use thiserror::Error;

const NALU_TYPE_SPS: u8 = 7;

/// ISO/IEC 23091-2 color description fields of an SPS, plus the video range
/// flag. Values are the raw code points, not framework enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodedColorAspects {
    pub primaries: u8,
    pub transfer: u8,
    pub matrix: u8,
    pub full_range: bool,
}

/// Scans an Annex-B fragment for an SPS NAL and returns its coded color
/// aspects, or `None` when there is no SPS or the SPS carries no video
/// signal description.
pub fn parse_color_aspects(data: &[u8]) -> Option<CodedColorAspects> {
    let mut pos = 0;
    while let Some(start_code) = find_start_code(data, pos) {
        let header = start_code + 3;
        if header >= data.len() {
            break;
        }
        let payload = header + 1;
        let end = find_start_code(data, payload).unwrap_or(data.len());
        if (data[header] & 0x1f) == NALU_TYPE_SPS {
            return match parse_sps_color_aspects(&data[payload..end]) {
                Ok(aspects) => aspects,
                Err(e) => {
                    log::debug!("Malformed SPS while looking for color aspects: {e}");
                    None
                }
            };
        }
        pos = payload;
    }

    log::debug!("No SPS found in input");
    None
}

fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    if data.len() < from + 3 {
        return None;
    }
    data[from..].windows(3).position(|w| w == [0, 0, 1]).map(|p| p + from)
}

/// Walks the SPS up to the VUI colour description. The syntax before it has
/// to be consumed field by field since everything is variably sized.
fn parse_sps_color_aspects(rbsp: &[u8]) -> anyhow::Result<Option<CodedColorAspects>> {
    let mut r = NaluReader::new(rbsp);

    let profile_idc: u32 = r.read_bits(8)?;
    // constraint_set flags, reserved bits and level_idc.
    r.skip_bits(16)?;
    let _seq_parameter_set_id: u32 = r.read_ue()?;

    if matches!(profile_idc, 100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135)
    {
        let chroma_format_idc: u32 = r.read_ue()?;
        if chroma_format_idc == 3 {
            // separate_colour_plane_flag
            r.skip_bits(1)?;
        }
        let _bit_depth_luma_minus8: u32 = r.read_ue()?;
        let _bit_depth_chroma_minus8: u32 = r.read_ue()?;
        // qpprime_y_zero_transform_bypass_flag
        r.skip_bits(1)?;
        if r.read_bit()? {
            // seq_scaling_matrix_present_flag
            let num_lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..num_lists {
                if r.read_bit()? {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    let _log2_max_frame_num_minus4: u32 = r.read_ue()?;
    let pic_order_cnt_type: u32 = r.read_ue()?;
    if pic_order_cnt_type == 0 {
        let _log2_max_pic_order_cnt_lsb_minus4: u32 = r.read_ue()?;
    } else if pic_order_cnt_type == 1 {
        // delta_pic_order_always_zero_flag
        r.skip_bits(1)?;
        let _offset_for_non_ref_pic: i32 = r.read_se()?;
        let _offset_for_top_to_bottom_field: i32 = r.read_se()?;
        let num_ref_frames_in_pic_order_cnt_cycle: u32 = r.read_ue()?;
        for _ in 0..num_ref_frames_in_pic_order_cnt_cycle {
            let _offset_for_ref_frame: i32 = r.read_se()?;
        }
    }
    let _max_num_ref_frames: u32 = r.read_ue()?;
    // gaps_in_frame_num_value_allowed_flag
    r.skip_bits(1)?;
    let _pic_width_in_mbs_minus1: u32 = r.read_ue()?;
    let _pic_height_in_map_units_minus1: u32 = r.read_ue()?;
    let frame_mbs_only_flag = r.read_bit()?;
    if !frame_mbs_only_flag {
        // mb_adaptive_frame_field_flag
        r.skip_bits(1)?;
    }
    // direct_8x8_inference_flag
    r.skip_bits(1)?;
    if r.read_bit()? {
        // frame_cropping_flag: four crop offsets.
        for _ in 0..4 {
            let _crop: u32 = r.read_ue()?;
        }
    }

    if !r.read_bit()? {
        // No VUI, so no color description.
        return Ok(None);
    }
    if r.read_bit()? {
        // aspect_ratio_info_present_flag
        let aspect_ratio_idc: u32 = r.read_bits(8)?;
        if aspect_ratio_idc == 255 {
            // Extended_SAR: sar_width and sar_height.
            r.skip_bits(32)?;
        }
    }
    if r.read_bit()? {
        // overscan_appropriate_flag
        r.skip_bits(1)?;
    }
    if !r.read_bit()? {
        // video_signal_type_present_flag
        return Ok(None);
    }
    // video_format
    r.skip_bits(3)?;
    let full_range = r.read_bit()?;
    let (primaries, transfer, matrix) = if r.read_bit()? {
        (r.read_bits::<u8>(8)?, r.read_bits::<u8>(8)?, r.read_bits::<u8>(8)?)
    } else {
        // colour_description absent: all three fields default to unspecified.
        (2, 2, 2)
    };

    Ok(Some(CodedColorAspects { primaries, transfer, matrix, full_range }))
}

/// Consumes a `scaling_list()` without retaining it.
fn skip_scaling_list(r: &mut NaluReader, size: usize) -> anyhow::Result<()> {
    let mut last_scale: i32 = 8;
    let mut next_scale: i32 = 8;
    for _ in 0..size {
        if next_scale != 0 {
            let delta_scale: i32 = r.read_se()?;
            next_scale = (last_scale + delta_scale + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

#[derive(Debug, Error)]
enum ReadBitsError {
    #[error("reader ran out of bits")]
    OutOfBits,
    #[error("more than 31 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("failed to convert read input to target type")]
    ConversionFailed,
}

/// A big-endian bit reader over an RBSP. Bytes are pulled into a 64-bit
/// lookahead cache in bulk, with H.264 emulation-prevention bytes stripped as
/// they are fed in; reads slice bits off the top of the pending region.
struct NaluReader<'a> {
    data: Cursor<&'a [u8]>,
    /// Unread bits are the low `cache_bits` bits, most significant first.
    /// Anything above them is garbage from previous reads.
    cache: u64,
    cache_bits: usize,
    /// Length of the current run of zero bytes fed into the cache.
    zero_run: usize,
}

impl<'a> NaluReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data: Cursor::new(data), cache: 0, cache_bits: 0, zero_run: 0 }
    }

    /// Tops the cache up to at least 57 pending bits, or to the end of the
    /// data.
    fn refill(&mut self) {
        while self.cache_bits <= 56 && self.data.has_remaining() {
            let byte = self.data.get_u8();
            if self.zero_run >= 2 && byte == 0x03 {
                // Emulation-prevention byte: drop it. It also terminates the
                // zero run, so the next one needs two fresh zero bytes.
                self.zero_run = 0;
                continue;
            }
            self.zero_run = if byte == 0 { self.zero_run + 1 } else { 0 };
            self.cache = (self.cache << 8) | u64::from(byte);
            self.cache_bits += 8;
        }
    }

    fn read_bit(&mut self) -> Result<bool, ReadBitsError> {
        Ok(self.read_bits::<u32>(1)? == 1)
    }

    fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> Result<U, ReadBitsError> {
        if num_bits > 31 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }
        if self.cache_bits < num_bits {
            self.refill();
            if self.cache_bits < num_bits {
                return Err(ReadBitsError::OutOfBits);
            }
        }

        self.cache_bits -= num_bits;
        let out = ((self.cache >> self.cache_bits) as u32) & ((1u32 << num_bits) - 1);
        U::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)
    }

    fn skip_bits(&mut self, mut num_bits: usize) -> Result<(), ReadBitsError> {
        while num_bits > 0 {
            let n = std::cmp::min(num_bits, 31);
            self.read_bits::<u32>(n)?;
            num_bits -= n;
        }
        Ok(())
    }

    fn read_ue<U: TryFrom<u32>>(&mut self) -> anyhow::Result<U> {
        let mut leading_zeros = 0;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(anyhow!("invalid exp-Golomb code"));
            }
        }

        let mut value = (1u32 << leading_zeros) - 1;
        if leading_zeros > 0 {
            value = value
                .checked_add(self.read_bits::<u32>(leading_zeros)?)
                .ok_or_else(|| anyhow!("exp-Golomb code out of range"))?;
        }
        U::try_from(value).map_err(|_| anyhow!("conversion error"))
    }

    fn read_se(&mut self) -> anyhow::Result<i32> {
        let ue = self.read_ue::<u32>()? as i32;
        if ue % 2 == 0 {
            Ok(-ue / 2)
        } else {
            Ok(ue / 2 + 1)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    /// Builds RBSP bytes from bit fields, inserting emulation-prevention
    /// bytes the way an encoder would.
    #[derive(Default)]
    pub(crate) struct RbspWriter {
        bits: Vec<bool>,
    }

    impl RbspWriter {
        pub(crate) fn push_bit(&mut self, bit: bool) {
            self.bits.push(bit);
        }

        pub(crate) fn push_bits(&mut self, value: u32, num_bits: usize) {
            for i in (0..num_bits).rev() {
                self.bits.push(value & (1 << i) != 0);
            }
        }

        pub(crate) fn push_ue(&mut self, value: u32) {
            let coded = value + 1;
            let len = 32 - coded.leading_zeros() as usize;
            self.push_bits(0, len - 1);
            self.push_bits(coded, len);
        }

        pub(crate) fn finish(mut self) -> Vec<u8> {
            // rbsp_stop_one_bit and alignment.
            self.push_bit(true);
            while self.bits.len() % 8 != 0 {
                self.push_bit(false);
            }

            let mut out: Vec<u8> = Vec::new();
            let mut zero_run = 0;
            for byte_bits in self.bits.chunks(8) {
                let byte = byte_bits.iter().fold(0u8, |acc, b| (acc << 1) | u8::from(*b));
                if zero_run == 2 && byte <= 3 {
                    out.push(0x03);
                    zero_run = 0;
                }
                zero_run = if byte == 0 { zero_run + 1 } else { 0 };
                out.push(byte);
            }
            out
        }
    }

    /// A 320x240 baseline SPS. `video_signal` controls whether the VUI video
    /// signal type (and with it the colour description) is present.
    pub(crate) fn sps_rbsp(video_signal: bool) -> Vec<u8> {
        let mut w = RbspWriter::default();
        w.push_bits(66, 8); // profile_idc (baseline, no chroma branch)
        w.push_bits(0, 8); // constraint flags + reserved
        w.push_bits(30, 8); // level_idc
        w.push_ue(0); // seq_parameter_set_id
        w.push_ue(0); // log2_max_frame_num_minus4
        w.push_ue(0); // pic_order_cnt_type
        w.push_ue(0); // log2_max_pic_order_cnt_lsb_minus4
        w.push_ue(1); // max_num_ref_frames
        w.push_bit(false); // gaps_in_frame_num_value_allowed_flag
        w.push_ue(19); // pic_width_in_mbs_minus1
        w.push_ue(14); // pic_height_in_map_units_minus1
        w.push_bit(true); // frame_mbs_only_flag
        w.push_bit(true); // direct_8x8_inference_flag
        w.push_bit(false); // frame_cropping_flag
        w.push_bit(true); // vui_parameters_present_flag
        w.push_bit(false); // aspect_ratio_info_present_flag
        w.push_bit(false); // overscan_info_present_flag
        w.push_bit(video_signal); // video_signal_type_present_flag
        if video_signal {
            w.push_bits(5, 3); // video_format (unspecified)
            w.push_bit(true); // video_full_range_flag
            w.push_bit(true); // colour_description_present_flag
            w.push_bits(1, 8); // colour_primaries (BT.709)
            w.push_bits(1, 8); // transfer_characteristics (BT.709)
            w.push_bits(1, 8); // matrix_coefficients (BT.709)
        }
        w.finish()
    }

    /// A complete Annex-B SPS NAL carrying BT.709 full-range aspects when
    /// `video_signal` is set.
    pub(crate) fn annex_b_sps(video_signal: bool) -> Vec<u8> {
        let mut stream = vec![0, 0, 0, 1, 0x67];
        stream.extend(sps_rbsp(video_signal));
        stream
    }
}

#[cfg(test)]
mod tests {
    use super::testing::annex_b_sps;
    use super::*;

    #[test]
    fn sps_with_colour_description() {
        let aspects = parse_color_aspects(&annex_b_sps(true)).unwrap();
        assert_eq!(
            aspects,
            CodedColorAspects { primaries: 1, transfer: 1, matrix: 1, full_range: true }
        );
    }

    #[test]
    fn sps_without_video_signal_type() {
        assert!(parse_color_aspects(&annex_b_sps(false)).is_none());
    }

    #[test]
    fn sps_behind_other_nals_is_found() {
        // An AUD and a PPS in front of the SPS.
        let mut stream = vec![0, 0, 0, 1, 0x09, 0xf0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80];
        stream.extend(annex_b_sps(true));
        assert!(parse_color_aspects(&stream).is_some());
    }

    #[test]
    fn stream_without_sps() {
        let stream = [0u8, 0, 1, 0x68, 0xce, 0x38, 0x80];
        assert!(parse_color_aspects(&stream).is_none());
    }

    #[test]
    fn garbage_input() {
        assert!(parse_color_aspects(&[]).is_none());
        assert!(parse_color_aspects(&[0, 0]).is_none());
        assert!(parse_color_aspects(&[0, 0, 1]).is_none());
        // A start code introducing a truncated SPS must not panic.
        assert!(parse_color_aspects(&[0, 0, 1, 0x67, 0x42]).is_none());
    }

    #[test]
    fn emulation_prevention_bytes_are_stripped() {
        // Both 0x03 bytes are emulation prevention; the payload is
        // 00 00 41 00 00 00.
        let mut reader = NaluReader::new(&[0x00, 0x00, 0x03, 0x41, 0x00, 0x00, 0x03, 0x00]);
        assert_eq!(reader.read_bits::<u32>(24).unwrap(), 0x41);
        assert_eq!(reader.read_bits::<u32>(24).unwrap(), 0);
        assert!(matches!(reader.read_bits::<u32>(1), Err(ReadBitsError::OutOfBits)));
    }

    #[test]
    fn epb_terminates_the_zero_run() {
        // 00 00 03 03: only the first 0x03 is emulation prevention, the
        // second is payload.
        let mut reader = NaluReader::new(&[0x00, 0x00, 0x03, 0x03]);
        assert_eq!(reader.read_bits::<u32>(24).unwrap(), 0x03);
        assert!(matches!(reader.read_bits::<u32>(1), Err(ReadBitsError::OutOfBits)));
    }
}
