//! Splits a raw TCP byte stream into frames.
//!
//! Three strategies are available: a single terminating byte, a fixed length,
//! and a [`Pipeline`] of delimited/fixed stages whose handlers pick the shape
//! of the next stage. All of them are driven through [`Framer`], a
//! `tokio_util` [`Decoder`], so they work with `FramedRead` directly.
//!
//! Parsing keeps a cursor into the buffered bytes, so a partially received
//! record is never rescanned from the start. Bytes that follow a complete
//! frame stay in the read buffer and seed the next one.

use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use iotgw_conf::{DelimType, Delimeter, Stage, StageAction, StageMode};

use crate::{Error, GatewayError, Result};

/// Shape of the next record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Delimited(Vec<u8>),
    Fixed(usize),
}

impl Mode {
    fn check(&self) -> Result<()> {
        match self {
            Mode::Delimited(d) if d.is_empty() => Err(anyhow!("empty delimiter")),
            _ => Ok(()),
        }
    }
}

#[derive(Debug)]
struct RecordParser {
    mode: Mode,
    // scan cursor, relative to the start of the buffered record
    pos: usize,
    // bytes of the delimiter matched so far
    delim_pos: usize,
    include_delimiter: bool,
    max_record_size: usize,
}

impl RecordParser {
    fn new(mode: Mode, include_delimiter: bool, max_record_size: usize) -> Result<Self> {
        mode.check()?;
        Ok(Self { mode, pos: 0, delim_pos: 0, include_delimiter, max_record_size })
    }

    fn set_mode(&mut self, mode: Mode) -> Result<()> {
        mode.check()?;
        self.mode = mode;
        self.pos = 0;
        self.delim_pos = 0;
        Ok(())
    }

    fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        let found = match &self.mode {
            Mode::Delimited(delim) => scan(&mut self.pos, &mut self.delim_pos, buf, delim)
                .map(|end| (end, if self.include_delimiter { 0 } else { delim.len() })),
            Mode::Fixed(n) => (buf.len() >= *n).then_some((*n, 0)),
        };

        match found {
            Some((end, strip)) => {
                let size = end - strip;
                self.check_size(size)?;
                let mut record = buf.split_to(end);
                record.truncate(size);
                Ok(Some(record.freeze()))
            }
            None => {
                self.check_size(buf.len())?;
                Ok(None)
            }
        }
    }

    #[inline]
    fn check_size(&self, size: usize) -> Result<()> {
        check_size(size, self.max_record_size)
    }
}

#[inline]
fn check_size(size: usize, max: usize) -> Result<()> {
    if max > 0 && size > max {
        log::error!("The current record is too long, {} > {}", size, max);
        return Err(GatewayError::FrameTooLong { size, max }.into());
    }
    Ok(())
}

/// Returns the end offset of the record, delimiter included.
fn scan(pos: &mut usize, delim_pos: &mut usize, buf: &[u8], delim: &[u8]) -> Option<usize> {
    while *pos < buf.len() {
        if buf[*pos] == delim[*delim_pos] {
            *delim_pos += 1;
            if *delim_pos == delim.len() {
                let end = *pos + 1;
                *pos = 0;
                *delim_pos = 0;
                return Some(end);
            }
        } else if *delim_pos > 0 {
            *pos -= *delim_pos;
            *delim_pos = 0;
        }
        *pos += 1;
    }
    None
}

pub type Handler = Box<dyn FnMut(Bytes, &mut PipeControl) -> Result<()> + Send>;

/// Passed to pipeline handlers to build the pending frame and steer the parser.
#[derive(Debug, Default)]
pub struct PipeControl {
    result: BytesMut,
    next: Option<Mode>,
    emit: Option<Bytes>,
}

impl PipeControl {
    #[inline]
    pub fn append(&mut self, data: &[u8]) {
        self.result.extend_from_slice(data);
    }

    /// Emits the pending frame and restarts at the first stage.
    #[inline]
    pub fn complete(&mut self) {
        self.emit = Some(self.result.split().freeze());
    }

    #[inline]
    pub fn delimited<D: Into<Vec<u8>>>(&mut self, delim: D) {
        self.next = Some(Mode::Delimited(delim.into()));
    }

    #[inline]
    pub fn fixed(&mut self, len: usize) {
        self.next = Some(Mode::Fixed(len));
    }

    #[inline]
    pub fn result(&self) -> &[u8] {
        &self.result
    }
}

/// Stages run in order and wrap around. Delimited stages hand their handler the
/// record without the delimiter.
pub struct Pipeline {
    parser: RecordParser,
    first: Mode,
    handlers: Vec<Handler>,
    stage: usize,
    control: PipeControl,
    max_record_size: usize,
}

impl Pipeline {
    pub fn builder(first: Mode) -> PipelineBuilder {
        PipelineBuilder { first, handlers: Vec::new(), max_record_size: 0 }
    }

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        loop {
            let record = match self.parser.parse(buf)? {
                Some(record) => record,
                None => return Ok(None),
            };
            (self.handlers[self.stage])(record, &mut self.control)?;
            check_size(self.control.result.len(), self.max_record_size)?;

            if let Some(frame) = self.control.emit.take() {
                self.control.next = None;
                self.stage = 0;
                self.parser.set_mode(self.first.clone())?;
                return Ok(Some(frame));
            }

            self.stage = (self.stage + 1) % self.handlers.len();
            if let Some(mode) = self.control.next.take() {
                self.parser.set_mode(mode)?;
            }
        }
    }
}

pub struct PipelineBuilder {
    first: Mode,
    handlers: Vec<Handler>,
    max_record_size: usize,
}

impl PipelineBuilder {
    pub fn handler<F>(mut self, f: F) -> Self
    where
        F: FnMut(Bytes, &mut PipeControl) -> Result<()> + Send + 'static,
    {
        self.handlers.push(Box::new(f));
        self
    }

    pub fn max_record_size(mut self, max: usize) -> Self {
        self.max_record_size = max;
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        if self.handlers.is_empty() {
            return Err(anyhow!("pipeline has no stage"));
        }
        Ok(Pipeline {
            parser: RecordParser::new(self.first.clone(), false, self.max_record_size)?,
            first: self.first,
            handlers: self.handlers,
            stage: 0,
            control: PipeControl::default(),
            max_record_size: self.max_record_size,
        })
    }
}

enum Strategy {
    Delimited(RecordParser),
    FixedLength(RecordParser),
    Pipeline(Pipeline),
}

/// Frame decoder of one connection.
pub struct Framer {
    strategy: Strategy,
    demand: u64,
}

impl Framer {
    /// Frames end with `delim`, which stays part of the frame.
    pub fn delimited(delim: u8, max_record_size: usize) -> Self {
        let parser = RecordParser {
            mode: Mode::Delimited(vec![delim]),
            pos: 0,
            delim_pos: 0,
            include_delimiter: true,
            max_record_size,
        };
        Self::with(Strategy::Delimited(parser))
    }

    pub fn fixed_length(len: usize, max_record_size: usize) -> Result<Self> {
        if len == 0 {
            return Err(anyhow!("fixed frame length must be positive"));
        }
        let parser = RecordParser::new(Mode::Fixed(len), false, max_record_size)?;
        Ok(Self::with(Strategy::FixedLength(parser)))
    }

    pub fn pipeline(pipeline: Pipeline) -> Self {
        Self::with(Strategy::Pipeline(pipeline))
    }

    #[inline]
    fn with(strategy: Strategy) -> Self {
        Self { strategy, demand: u64::MAX }
    }

    pub fn from_conf(cfg: &Delimeter) -> Result<Self> {
        match cfg.typ {
            DelimType::Delimited => {
                let delim = cfg.delimited.as_bytes().last().ok_or_else(|| anyhow!("empty delimiter"))?;
                Ok(Self::delimited(*delim, cfg.max_record_size))
            }
            DelimType::FixLength => Self::fixed_length(cfg.length, cfg.max_record_size),
            DelimType::SplitFunc => Ok(Self::pipeline(stages_pipeline(&cfg.stages, cfg.max_record_size)?)),
        }
    }

    /// Allows `n` more frames to be decoded.
    #[inline]
    pub fn fetch(&mut self, n: u64) {
        self.demand = self.demand.saturating_add(n);
    }

    #[inline]
    pub fn pause(&mut self) {
        self.demand = 0;
    }

    #[inline]
    pub fn resume(&mut self) {
        self.demand = u64::MAX;
    }

    #[inline]
    pub fn demand(&self) -> u64 {
        self.demand
    }

    #[inline]
    fn max_record_size(&self) -> usize {
        match &self.strategy {
            Strategy::Delimited(p) | Strategy::FixedLength(p) => p.max_record_size,
            Strategy::Pipeline(p) => p.max_record_size,
        }
    }
}

impl Decoder for Framer {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        if self.demand == 0 {
            // nothing is parsed, but unread input stays bounded
            check_size(buf.len(), self.max_record_size())?;
            return Ok(None);
        }
        let frame = match &mut self.strategy {
            Strategy::Delimited(p) | Strategy::FixedLength(p) => p.parse(buf)?,
            Strategy::Pipeline(p) => p.decode(buf)?,
        };
        if frame.is_some() && self.demand != u64::MAX {
            self.demand -= 1;
        }
        Ok(frame)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !buf.is_empty() && self.demand > 0 {
                    log::debug!("discard {} bytes of an incomplete frame", buf.len());
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

fn stage_mode(stage: &Stage) -> Result<Option<Mode>> {
    match stage.mode {
        StageMode::Delimited if stage.delimited.is_empty() => Err(anyhow!("delimited stage without delimiter")),
        StageMode::Delimited => Ok(Some(Mode::Delimited(stage.delimited.as_bytes().to_vec()))),
        // length comes from the previous stage
        StageMode::Fixed if stage.length == 0 => Ok(None),
        StageMode::Fixed => Ok(Some(Mode::Fixed(stage.length))),
    }
}

fn stages_pipeline(stages: &[Stage], max_record_size: usize) -> Result<Pipeline> {
    let modes = stages.iter().map(stage_mode).collect::<Result<Vec<_>>>()?;
    let first = match modes.first() {
        Some(Some(mode)) => mode.clone(),
        Some(None) => return Err(anyhow!("the first stage needs a fixed length")),
        None => return Err(anyhow!("no stages configured")),
    };

    let mut builder = Pipeline::builder(first).max_record_size(max_record_size);
    for (i, stage) in stages.iter().enumerate() {
        let next_idx = (i + 1) % stages.len();
        if modes[next_idx].is_none() && stage.action != StageAction::Length {
            return Err(anyhow!("stage {} has no length and does not follow a length stage", next_idx));
        }
        let action = stage.action;
        let next = modes[next_idx].clone();
        builder = builder.handler(move |record, ctl| {
            match action {
                StageAction::Append => ctl.append(&record),
                StageAction::Complete => {
                    ctl.append(&record);
                    ctl.complete();
                    return Ok(());
                }
                StageAction::Length => {
                    ctl.append(&record);
                    ctl.fixed(be_length(&record)?);
                    return Ok(());
                }
                StageAction::Skip => {}
            }
            match &next {
                Some(Mode::Delimited(d)) => ctl.delimited(d.clone()),
                Some(Mode::Fixed(n)) => ctl.fixed(*n),
                None => {}
            }
            Ok(())
        });
    }
    builder.build()
}

fn be_length(data: &[u8]) -> Result<usize> {
    if data.is_empty() || data.len() > 8 {
        return Err(anyhow!("length field of {} bytes", data.len()));
    }
    let n = data.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
    usize::try_from(n).map_err(|e| anyhow!(e))
}
