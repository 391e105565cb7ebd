use super::{ListEntry, SmlError, SmlValue};
use log::warn;

pub const SML_GET_LIST_RESPONSE: u16 = 0x701;

// Type fields of the SML type-length byte
const TYPE_OCTET: u8 = 0;
const TYPE_BOOL: u8 = 4;
const TYPE_INT: u8 = 5;
const TYPE_UINT: u8 = 6;
const TYPE_LIST: u8 = 7;

/// Parses the content of one transport frame (start/end sequences already
/// stripped) and returns every value-list entry of every GetListResponse in
/// it. Other message types are skipped.
pub fn parse_frame(data: &[u8]) -> Result<Vec<ListEntry>, SmlError> {
    let mut parser = SmlParser::new(data);
    let mut entries = Vec::new();
    let mut messages = 0usize;

    while parser.pos < parser.data.len() {
        // Padding between and after messages
        if parser.data[parser.pos] == 0x00 {
            parser.pos += 1;
            continue;
        }

        match parser.parse_message(&mut entries) {
            Ok(()) => messages += 1,
            Err(e) => {
                warn!("Failed to parse SML message at position {}: {e}", parser.pos);
                break;
            }
        }
    }

    if messages == 0 {
        return Err(SmlError::Frame("no valid SML messages found".to_string()));
    }

    Ok(entries)
}

struct SmlParser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SmlParser<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn parse_message(&mut self, entries: &mut Vec<ListEntry>) -> Result<(), SmlError> {
        self.expect_list(6)?;
        self.skip_element()?; // transaction id
        self.skip_element()?; // group no
        self.skip_element()?; // abort on error

        // The message body is a choice: [type, value]
        self.expect_list(2)?;
        let msg_type = self.parse_unsigned()?;
        if msg_type == SML_GET_LIST_RESPONSE as u64 {
            self.parse_get_list_response(entries)?;
        } else {
            self.skip_element()?;
        }

        self.skip_element()?; // crc

        // end of message marker
        if self.pos < self.data.len() && self.data[self.pos] == 0x00 {
            self.pos += 1;
        }

        Ok(())
    }

    fn parse_get_list_response(&mut self, entries: &mut Vec<ListEntry>) -> Result<(), SmlError> {
        self.expect_list(7)?;
        self.skip_element()?; // client id
        self.skip_element()?; // server id
        self.skip_element()?; // list name
        self.skip_element()?; // act sensor time

        let count = self.parse_list_len()?;
        for _ in 0..count {
            if let Some(entry) = self.parse_list_entry()? {
                entries.push(entry);
            }
        }

        self.skip_element()?; // list signature
        self.skip_element()?; // act gateway time
        Ok(())
    }

    fn parse_list_entry(&mut self) -> Result<Option<ListEntry>, SmlError> {
        self.expect_list(7)?;
        let obis = self.parse_octet_string()?;
        self.skip_element()?; // status
        self.skip_element()?; // val time
        let unit = self.parse_optional_unsigned()?.map(|u| u as u8);
        let scaler = self.parse_optional_signed()?.map(|s| s as i8);
        let value = self.parse_value()?;
        self.skip_element()?; // value signature

        match (obis, value) {
            (Some(obis), Some(value)) => Ok(Some(ListEntry { obis, value, scaler, unit })),
            // Entries without an OBIS code or value carry nothing we can route
            _ => Ok(None),
        }
    }

    // Basic type parsers

    fn parse_tl(&mut self) -> Result<(u8, usize), SmlError> {
        let first = self.take_byte()?;
        let type_field = (first >> 4) & 0x07;
        let mut length = (first & 0x0F) as usize;

        if length == 0x0F {
            // Extended length
            length = self.take_byte()? as usize;
        }

        Ok((type_field, length))
    }

    fn parse_list_len(&mut self) -> Result<usize, SmlError> {
        let (type_field, length) = self.parse_tl()?;
        if type_field != TYPE_LIST {
            return Err(SmlError::Frame(format!("expected list, got type {type_field}")));
        }
        Ok(length)
    }

    fn expect_list(&mut self, expected: usize) -> Result<(), SmlError> {
        let length = self.parse_list_len()?;
        if length != expected {
            return Err(SmlError::Frame(format!(
                "expected list of {expected}, got {length}"
            )));
        }
        Ok(())
    }

    /// For non-list types the length field counts the type-length byte itself;
    /// a bare 0x01 is an omitted optional.
    fn parse_octet_string(&mut self) -> Result<Option<Vec<u8>>, SmlError> {
        let (type_field, length) = self.parse_tl()?;
        if type_field != TYPE_OCTET {
            return Err(SmlError::Frame(format!(
                "expected octet string, got type {type_field}"
            )));
        }
        if length == 0 {
            return Err(SmlError::Frame("zero-length octet string field".to_string()));
        }
        if length == 1 {
            return Ok(None);
        }

        Ok(Some(self.take(length - 1)?.to_vec()))
    }

    fn parse_unsigned(&mut self) -> Result<u64, SmlError> {
        let (type_field, length) = self.parse_tl()?;
        if type_field != TYPE_UINT {
            return Err(SmlError::Frame(format!(
                "expected unsigned, got type {type_field}"
            )));
        }
        self.read_uint(length.saturating_sub(1))
    }

    fn parse_optional_unsigned(&mut self) -> Result<Option<u64>, SmlError> {
        let (type_field, length) = self.parse_tl()?;
        match type_field {
            TYPE_OCTET if length <= 1 => Ok(None),
            TYPE_UINT => Ok(Some(self.read_uint(length.saturating_sub(1))?)),
            _ => Err(SmlError::Frame(format!(
                "expected optional unsigned, got type {type_field}"
            ))),
        }
    }

    fn parse_optional_signed(&mut self) -> Result<Option<i64>, SmlError> {
        let (type_field, length) = self.parse_tl()?;
        match type_field {
            TYPE_OCTET if length <= 1 => Ok(None),
            TYPE_INT => Ok(Some(self.read_int(length.saturating_sub(1))?)),
            TYPE_UINT => Ok(Some(self.read_uint(length.saturating_sub(1))? as i64)),
            _ => Err(SmlError::Frame(format!(
                "expected optional signed, got type {type_field}"
            ))),
        }
    }

    /// Meters transmit integers in odd widths (u24, i40, ...), so any width of
    /// 1 to 8 bytes is accepted.
    fn read_uint(&mut self, bytes: usize) -> Result<u64, SmlError> {
        if bytes == 0 || bytes > 8 {
            return Err(SmlError::Frame(format!("invalid integer width {bytes}")));
        }

        let mut value: u64 = 0;
        for &b in self.take(bytes)? {
            value = (value << 8) | b as u64;
        }
        Ok(value)
    }

    fn read_int(&mut self, bytes: usize) -> Result<i64, SmlError> {
        let raw = self.read_uint(bytes)?;
        if bytes < 8 && raw & (1 << (bytes * 8 - 1)) != 0 {
            // Sign-extend
            return Ok((raw | (!0u64 << (bytes * 8))) as i64);
        }
        Ok(raw as i64)
    }

    fn parse_value(&mut self) -> Result<Option<SmlValue>, SmlError> {
        let (type_field, length) = self.parse_tl()?;
        match type_field {
            TYPE_OCTET => {
                if length <= 1 {
                    return Ok(None);
                }
                Ok(Some(SmlValue::Bytes(self.take(length - 1)?.to_vec())))
            }
            TYPE_BOOL => {
                if length != 2 {
                    return Err(SmlError::Frame(format!("invalid bool length {length}")));
                }
                Ok(Some(SmlValue::Bool(self.take_byte()? != 0)))
            }
            TYPE_INT => Ok(Some(SmlValue::Int(self.read_int(length.saturating_sub(1))?))),
            TYPE_UINT => Ok(Some(SmlValue::UInt(self.read_uint(length.saturating_sub(1))?))),
            TYPE_LIST => {
                for _ in 0..length {
                    self.skip_element()?;
                }
                Ok(None)
            }
            _ => Err(SmlError::Frame(format!("unknown value type {type_field}"))),
        }
    }

    fn skip_element(&mut self) -> Result<(), SmlError> {
        let (type_field, length) = self.parse_tl()?;
        if type_field == TYPE_LIST {
            for _ in 0..length {
                self.skip_element()?;
            }
            return Ok(());
        }

        if length == 0 {
            return Err(SmlError::Frame("zero-length field".to_string()));
        }
        self.take(length - 1)?;
        Ok(())
    }

    fn take_byte(&mut self) -> Result<u8, SmlError> {
        if self.pos >= self.data.len() {
            return Err(SmlError::Frame("unexpected end of data".to_string()));
        }
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], SmlError> {
        if self.pos + count > self.data.len() {
            return Err(SmlError::Frame("field extends beyond data".to_string()));
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }
}
