use crate::protocol::DataTypeMask;
use byteorder::{BigEndian, ByteOrder};

/// First two bytes of every profile datagram.
pub const DATA_MAGIC: u16 = 0xFACE;

/// Fixed header size of a profile datagram.
pub const DATAGRAM_HEADER_SIZE: usize = 40;

/// Theoretical maximum datagram size accepted from the data channel.
pub const MAX_DATAGRAM_SIZE: usize = 61440;

/// Decoded profile datagram header. All multi-byte fields are big-endian
/// on the wire.
#[derive(Debug, Clone, Copy)]
pub struct DatagramHeader {
    pub magic: u16,
    pub exposure_time_us: u16,
    pub scan_head_id: u8,
    pub camera_port: u8,
    pub laser_port: u8,
    pub flags: u8,
    pub timestamp_ns: u64,
    pub laser_on_time_us: u16,
    pub data_type: DataTypeMask,
    pub data_length: u16,
    pub number_encoders: u8,
    pub datagram_position: u32,
    pub number_datagrams: u32,
    pub start_column: u16,
    pub end_column: u16,
    pub sequence_number: u32,
}

/// One parsed profile datagram with borrowed views of its data regions.
///
/// The payload order after the header is fixed: one `u16` stride per set
/// data-type bit, `number_encoders` big-endian `i64` values, brightness
/// bytes, XY point pairs, then subpixel words. Subpixel data is skipped
/// over but never referenced.
#[derive(Debug)]
pub struct DataPacket<'a> {
    pub header: DatagramHeader,
    pub encoders: Vec<i64>,
    pub data_stride: u32,
    pub data_count: u32,
    pub brightness: Option<&'a [u8]>,
    pub xy: Option<&'a [u8]>,
}

impl<'a> DataPacket<'a> {
    /// Parse a datagram. `None` for anything that is not a well-formed
    /// profile datagram; the receive loop drops those.
    pub fn parse(buf: &'a [u8]) -> Option<DataPacket<'a>> {
        if buf.len() < DATAGRAM_HEADER_SIZE {
            return None;
        }

        let header = DatagramHeader {
            magic: BigEndian::read_u16(&buf[0..2]),
            exposure_time_us: BigEndian::read_u16(&buf[2..4]),
            scan_head_id: buf[4],
            camera_port: buf[5],
            laser_port: buf[6],
            flags: buf[7],
            timestamp_ns: BigEndian::read_u64(&buf[8..16]),
            laser_on_time_us: BigEndian::read_u16(&buf[16..18]),
            data_type: DataTypeMask::from_bits_truncate(BigEndian::read_u16(&buf[18..20])),
            data_length: BigEndian::read_u16(&buf[20..22]),
            number_encoders: buf[22],
            datagram_position: BigEndian::read_u32(&buf[24..28]),
            number_datagrams: BigEndian::read_u32(&buf[28..32]),
            start_column: BigEndian::read_u16(&buf[32..34]),
            end_column: BigEndian::read_u16(&buf[34..36]),
            sequence_number: BigEndian::read_u32(&buf[36..40]),
        };

        if header.magic != DATA_MAGIC {
            return None;
        }

        // The TCP data channel carries whole profiles in single datagrams.
        if header.number_datagrams != 1 || header.datagram_position != 0 {
            return None;
        }

        if header.end_column < header.start_column {
            return None;
        }

        let num_data_types = header.data_type.bits().count_ones() as usize;
        let mut offset = DATAGRAM_HEADER_SIZE;

        // One stride word per present data type; all types share the first.
        if buf.len() < offset + num_data_types * 2 {
            return None;
        }
        let data_stride = if num_data_types > 0 {
            BigEndian::read_u16(&buf[offset..offset + 2]) as u32
        } else {
            return None;
        };
        offset += num_data_types * 2;

        if data_stride == 0 {
            return None;
        }
        let data_count = (header.end_column - header.start_column + 1) as u32 / data_stride;

        let encoders_len = header.number_encoders as usize;
        if buf.len() < offset + encoders_len * 8 {
            return None;
        }
        let mut encoders = Vec::with_capacity(encoders_len);
        for _ in 0..encoders_len {
            encoders.push(BigEndian::read_i64(&buf[offset..offset + 8]));
            offset += 8;
        }

        let brightness = if header.data_type.contains(DataTypeMask::BRIGHTNESS) {
            let len = data_count as usize;
            if buf.len() < offset + len {
                return None;
            }
            let region = &buf[offset..offset + len];
            offset += len;
            Some(region)
        } else {
            None
        };

        let xy = if header.data_type.contains(DataTypeMask::XY) {
            let len = 4 * data_count as usize;
            if buf.len() < offset + len {
                return None;
            }
            let region = &buf[offset..offset + len];
            offset += len;
            Some(region)
        } else {
            None
        };

        // Subpixel data: advance past, never materialize.
        if header.data_type.contains(DataTypeMask::SUBPIXEL) {
            let len = 2 * data_count as usize;
            if buf.len() < offset + len {
                return None;
            }
        }

        Some(DataPacket {
            header,
            encoders,
            data_stride,
            data_count,
            brightness,
            xy,
        })
    }

    /// X/Y of the `n`th point, big-endian i16 pairs.
    pub fn point_xy(&self, n: usize) -> Option<(i16, i16)> {
        let xy = self.xy?;
        let base = n * 4;
        if base + 4 > xy.len() {
            return None;
        }
        Some((
            BigEndian::read_i16(&xy[base..base + 2]),
            BigEndian::read_i16(&xy[base + 2..base + 4]),
        ))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::DatagramBuilder;
    use super::*;

    #[test]
    fn parses_header_and_regions() {
        let mut builder = DatagramBuilder::new(vec![(10, 20, 200), (-5, 8, 90), (0, 0, 1)]);
        builder.scan_head_id = 7;
        builder.camera_port = 1;
        builder.sequence_number = 99;
        builder.encoders = vec![1234, -42];
        let bytes = builder.build();

        let packet = DataPacket::parse(&bytes).unwrap();
        assert_eq!(packet.header.scan_head_id, 7);
        assert_eq!(packet.header.camera_port, 1);
        assert_eq!(packet.header.sequence_number, 99);
        assert_eq!(packet.encoders, vec![1234, -42]);
        assert_eq!(packet.data_count, 3);
        assert_eq!(packet.data_stride, 1);
        assert_eq!(packet.brightness.unwrap(), &[200, 90, 1]);
        assert_eq!(packet.point_xy(0), Some((10, 20)));
        assert_eq!(packet.point_xy(1), Some((-5, 8)));
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = DatagramBuilder::new(vec![(1, 1, 1)]).build();
        let mut corrupted = bytes.clone();
        corrupted[0] = 0x00;
        assert!(DataPacket::parse(&corrupted).is_none());
        assert!(DataPacket::parse(&bytes).is_some());
    }

    #[test]
    fn rejects_truncated_payload() {
        let bytes = DatagramBuilder::new(vec![(1, 1, 1), (2, 2, 2)]).build();
        assert!(DataPacket::parse(&bytes[..bytes.len() - 3]).is_none());
    }

    #[test]
    fn xy_only_has_no_brightness_region() {
        let mut builder = DatagramBuilder::new(vec![(3, 4, 0), (5, 6, 0)]);
        builder.with_brightness = false;
        let bytes = builder.build();

        let packet = DataPacket::parse(&bytes).unwrap();
        assert!(packet.brightness.is_none());
        assert_eq!(packet.point_xy(1), Some((5, 6)));
    }

    #[test]
    fn stride_divides_column_span() {
        // 8 columns at stride 2 -> 4 points.
        let points = vec![(1, 1, 1), (2, 2, 2), (3, 3, 3), (4, 4, 4)];
        let mut builder = DatagramBuilder::new(points);
        builder.stride = 2;
        builder.start_column = 0;
        builder.end_column = 7;
        let bytes = builder.build();

        let packet = DataPacket::parse(&bytes).unwrap();
        assert_eq!(packet.data_count, 4);
        assert_eq!(packet.data_stride, 2);
    }

    #[test]
    fn multi_datagram_profiles_are_rejected() {
        let bytes = DatagramBuilder::new(vec![(1, 1, 1)]).build();
        let mut split = bytes.clone();
        BigEndian::write_u32(&mut split[28..32], 2);
        assert!(DataPacket::parse(&split).is_none());
    }
}
