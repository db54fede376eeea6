//! Serial line parameters and the timing quantities derived from them.
//!
//! Actual serial IO lives behind [`crate::transport::Transport`]; only the
//! baud-rate-derived inter-frame silence matters to the engine, because RTU
//! delimits frames by 3.5 character times of quiet line.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use mbsrv_protocol::Result;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Serialize, Deserialize, Hash)]
pub enum StopBits {
    One,
    Two,
}

#[derive(Debug, Eq, PartialEq, Clone, Copy, Serialize, Deserialize, Hash)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Eq, PartialEq, Clone, Copy, Serialize, Deserialize, Hash)]
pub enum DataBits {
    Seven,
    Eight,
}

pub fn parse_serial_settings(settings: &str) -> Result<(DataBits, Parity, StopBits)> {
    let settings = settings.to_lowercase();
    let chars = settings.as_bytes();
    if chars.len() != 3 {
        return Err(mbsrv_protocol::Error::invalid_request(anyhow!(
            "Invalid serial settings: {}",
            settings
        )));
    }
    let data_bits = match chars[0] as char {
        '8' => DataBits::Eight,
        '7' => DataBits::Seven,
        _ => {
            return Err(mbsrv_protocol::Error::invalid_request(anyhow!(
                "Invalid data bits: {}",
                settings
            )))
        }
    };
    let parity = match chars[1] as char {
        'n' => Parity::None,
        'o' => Parity::Odd,
        'e' => Parity::Even,
        _ => {
            return Err(mbsrv_protocol::Error::invalid_request(anyhow!(
                "Invalid parity: {}",
                settings
            )))
        }
    };
    let stop_bits = match chars[2] as char {
        '1' => StopBits::One,
        '2' => StopBits::Two,
        _ => {
            return Err(mbsrv_protocol::Error::invalid_request(anyhow!(
                "Invalid stop bits: {}",
                settings
            )))
        }
    };
    Ok((data_bits, parity, stop_bits))
}

#[derive(Debug, Eq, PartialEq, Clone, Serialize, Deserialize, Hash)]
pub struct SerialParams {
    pub baud: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

impl SerialParams {
    pub fn new(baud: u32, settings: &str) -> Result<Self> {
        let (data_bits, parity, stop_bits) = parse_serial_settings(settings)?;
        Ok(Self {
            baud,
            data_bits,
            stop_bits,
            parity,
        })
    }

    /// Bits on the wire per character: start bit + data + parity + stop.
    pub fn bits_per_char(&self) -> u32 {
        let data = match self.data_bits {
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        };
        let parity = match self.parity {
            Parity::None => 0,
            _ => 1,
        };
        let stop = match self.stop_bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        };
        1 + data + parity + stop
    }

    /// Transmission time of one character at the configured baud rate.
    pub fn char_time(&self) -> Duration {
        Duration::from_secs_f64(f64::from(self.bits_per_char()) / f64::from(self.baud))
    }

    /// The 3.5-character inter-frame silence. Above 19200 baud the serial
    /// line specification fixes it at 1.75 ms.
    pub fn silent_interval(&self) -> Duration {
        if self.baud > 19_200 {
            Duration::from_micros(1750)
        } else {
            self.char_time().mul_f64(3.5)
        }
    }
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            baud: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_serial_settings() {
        assert_eq!(
            parse_serial_settings("8N1").unwrap(),
            (DataBits::Eight, Parity::None, StopBits::One)
        );
        assert_eq!(
            parse_serial_settings("7e2").unwrap(),
            (DataBits::Seven, Parity::Even, StopBits::Two)
        );
        assert!(parse_serial_settings("9N1").is_err());
        assert!(parse_serial_settings("8X1").is_err());
        assert!(parse_serial_settings("8N12").is_err());
    }

    #[test]
    fn test_char_time_9600_8n1() {
        let params = SerialParams::new(9600, "8N1").unwrap();
        assert_eq!(params.bits_per_char(), 10);
        // 10 bits / 9600 baud ~ 1.042 ms
        let micros = params.char_time().as_micros();
        assert!((1041..=1042).contains(&micros));
        // 3.5 chars ~ 3.646 ms
        let silent = params.silent_interval().as_micros();
        assert!((3645..=3647).contains(&silent));
    }

    #[test]
    fn test_silent_interval_capped_above_19200() {
        let params = SerialParams::new(115_200, "8N1").unwrap();
        assert_eq!(params.silent_interval(), Duration::from_micros(1750));
    }
}
