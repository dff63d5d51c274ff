use std::path::{Path, PathBuf};

use libgpiod::{chip::Chip, line, request};
use parking_lot::Mutex;

use crate::error::AppError;
use crate::gpio::{GpioBackend, GpioChip, LineMode, LineRequest};

const LIBGPIOD_DEV_DIR: &str = "/dev";

/// Character-device backend. Chip names without a leading `/` are resolved
/// under `/dev`.
#[derive(Default)]
pub struct LibgpiodBackend;

impl LibgpiodBackend {
    pub fn new() -> Self {
        Self
    }

    fn chip_path(name: &str) -> PathBuf {
        if name.starts_with('/') {
            PathBuf::from(name)
        } else {
            Path::new(LIBGPIOD_DEV_DIR).join(name)
        }
    }

    fn make_line_settings(mode: LineMode) -> Result<line::Settings, AppError> {
        let mut ls =
            line::Settings::new().map_err(|e| AppError::Gpio(format!("libgpiod settings: {e}")))?;

        match mode {
            LineMode::Input => {
                ls.set_direction(line::Direction::Input)
                    .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
            }
            LineMode::Output { value } => {
                ls.set_direction(line::Direction::Output)
                    .map_err(|e| AppError::Gpio(format!("set direction: {e}")))?;
                ls.set_output_value(if value == 0 {
                    line::Value::InActive
                } else {
                    line::Value::Active
                })
                .map_err(|e| AppError::Gpio(format!("set output value: {e}")))?;
            }
        }

        Ok(ls)
    }

    fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config, AppError> {
        let mut cfg =
            line::Config::new().map_err(|e| AppError::Gpio(format!("line config: {e}")))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| AppError::Gpio(format!("line config add settings: {e}")))?;
        Ok(cfg)
    }
}

impl GpioBackend for LibgpiodBackend {
    fn open_chip(&self, name: &str) -> Result<Box<dyn GpioChip>, AppError> {
        let path = Self::chip_path(name);
        let chip = Chip::open(&path)
            .map_err(|e| AppError::ChipOpen(format!("{}: {e}", path.display())))?;
        let num_lines = chip
            .info()
            .map_err(|e| AppError::ChipOpen(format!("chip info {}: {e}", path.display())))?
            .num_lines() as u32;

        Ok(Box::new(LibgpiodChip {
            chip: Mutex::new(chip),
            num_lines,
        }))
    }
}

struct LibgpiodChip {
    chip: Mutex<Chip>,
    num_lines: u32,
}

impl GpioChip for LibgpiodChip {
    fn num_lines(&self) -> u32 {
        self.num_lines
    }

    fn line_consumer(&self, offset: u32) -> Result<Option<String>, AppError> {
        let info = self
            .chip
            .lock()
            .line_info(offset)
            .map_err(|e| AppError::Gpio(format!("line info {offset}: {e}")))?;

        // an unclaimed line has no consumer string at all
        Ok(info
            .consumer()
            .ok()
            .filter(|c| !c.is_empty())
            .map(str::to_string))
    }

    fn request_line(
        &self,
        offset: u32,
        mode: LineMode,
        consumer: &str,
    ) -> Result<Box<dyn LineRequest>, AppError> {
        let line_settings = LibgpiodBackend::make_line_settings(mode)?;
        let line_cfg = LibgpiodBackend::make_line_config(offset, line_settings)?;

        let mut req_cfg =
            request::Config::new().map_err(|e| AppError::Gpio(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(consumer)
            .map_err(|e| AppError::Gpio(format!("request consumer: {e}")))?;

        let request = self
            .chip
            .lock()
            .request_lines(Some(&req_cfg), &line_cfg)
            .map_err(|e| AppError::Gpio(format!("request lines: {e}")))?;

        Ok(Box::new(LibgpiodLine {
            offset,
            request: Mutex::new(request),
        }))
    }
}

struct LibgpiodLine {
    offset: u32,
    request: Mutex<request::Request>,
}

impl LineRequest for LibgpiodLine {
    fn value(&self) -> Result<u8, AppError> {
        let value = self
            .request
            .lock()
            .value(self.offset)
            .map_err(|e| AppError::Gpio(format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => 0,
            line::Value::Active => 1,
        })
    }

    fn release(self: Box<Self>) -> Result<(), AppError> {
        // gpiod_line_request_release runs on drop and cannot fail
        drop(self.request.into_inner());
        Ok(())
    }
}
