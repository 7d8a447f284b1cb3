//! Operator registry and per-operator bookkeeping.
//!
//! The core never executes kernels; it resolves each serialized operator to
//! a registration supplied by the host, parses builtin option bytes into
//! typed parameter structs, and bundles everything into
//! [`NodeAndRegistration`] records the inference loop consumes.

use tracing::debug;

use crate::error::{ForgeResult, MicroForgeError};
use crate::tensor::IntArray;

/// Builtin operator identifiers.
///
/// `Custom` marks operators resolved by name with an opaque option payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinOperator {
    FullyConnected,
    Conv2D,
    DepthwiseConv2D,
    MaxPool2D,
    AveragePool2D,
    Softmax,
    Add,
    Mul,
    Reshape,
    Custom,
}

impl BuiltinOperator {
    /// Decode from the serialized opcode.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(BuiltinOperator::FullyConnected),
            1 => Some(BuiltinOperator::Conv2D),
            2 => Some(BuiltinOperator::DepthwiseConv2D),
            3 => Some(BuiltinOperator::MaxPool2D),
            4 => Some(BuiltinOperator::AveragePool2D),
            5 => Some(BuiltinOperator::Softmax),
            6 => Some(BuiltinOperator::Add),
            7 => Some(BuiltinOperator::Mul),
            8 => Some(BuiltinOperator::Reshape),
            9 => Some(BuiltinOperator::Custom),
            _ => None,
        }
    }

    /// Serialized opcode.
    pub fn code(&self) -> u32 {
        match self {
            BuiltinOperator::FullyConnected => 0,
            BuiltinOperator::Conv2D => 1,
            BuiltinOperator::DepthwiseConv2D => 2,
            BuiltinOperator::MaxPool2D => 3,
            BuiltinOperator::AveragePool2D => 4,
            BuiltinOperator::Softmax => 5,
            BuiltinOperator::Add => 6,
            BuiltinOperator::Mul => 7,
            BuiltinOperator::Reshape => 8,
            BuiltinOperator::Custom => 9,
        }
    }

    /// Diagnostic name.
    pub fn name(&self) -> &'static str {
        match self {
            BuiltinOperator::FullyConnected => "FULLY_CONNECTED",
            BuiltinOperator::Conv2D => "CONV_2D",
            BuiltinOperator::DepthwiseConv2D => "DEPTHWISE_CONV_2D",
            BuiltinOperator::MaxPool2D => "MAX_POOL_2D",
            BuiltinOperator::AveragePool2D => "AVERAGE_POOL_2D",
            BuiltinOperator::Softmax => "SOFTMAX",
            BuiltinOperator::Add => "ADD",
            BuiltinOperator::Mul => "MUL",
            BuiltinOperator::Reshape => "RESHAPE",
            BuiltinOperator::Custom => "CUSTOM",
        }
    }
}

/// Fused activation applied after an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    None,
    Relu,
    Relu6,
    Tanh,
}

impl Activation {
    fn from_code(code: u32) -> ForgeResult<Self> {
        match code {
            0 => Ok(Activation::None),
            1 => Ok(Activation::Relu),
            2 => Ok(Activation::Relu6),
            3 => Ok(Activation::Tanh),
            _ => Err(MicroForgeError::InvalidModelFile(format!(
                "unknown activation code {code}"
            ))),
        }
    }

    fn code(&self) -> u32 {
        match self {
            Activation::None => 0,
            Activation::Relu => 1,
            Activation::Relu6 => 2,
            Activation::Tanh => 3,
        }
    }
}

/// Padding scheme for convolution and pooling windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Padding {
    #[default]
    Same,
    Valid,
}

impl Padding {
    fn from_code(code: u32) -> ForgeResult<Self> {
        match code {
            0 => Ok(Padding::Same),
            1 => Ok(Padding::Valid),
            _ => Err(MicroForgeError::InvalidModelFile(format!(
                "unknown padding code {code}"
            ))),
        }
    }

    fn code(&self) -> u32 {
        match self {
            Padding::Same => 0,
            Padding::Valid => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FullyConnectedParams {
    pub activation: Activation,
    pub keep_num_dims: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2DParams {
    pub padding: Padding,
    pub stride_w: u32,
    pub stride_h: u32,
    pub dilation_w: u32,
    pub dilation_h: u32,
    pub activation: Activation,
}

impl Default for Conv2DParams {
    fn default() -> Self {
        Conv2DParams {
            padding: Padding::Same,
            stride_w: 1,
            stride_h: 1,
            dilation_w: 1,
            dilation_h: 1,
            activation: Activation::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthwiseConv2DParams {
    pub padding: Padding,
    pub stride_w: u32,
    pub stride_h: u32,
    pub depth_multiplier: u32,
    pub dilation_w: u32,
    pub dilation_h: u32,
    pub activation: Activation,
}

impl Default for DepthwiseConv2DParams {
    fn default() -> Self {
        DepthwiseConv2DParams {
            padding: Padding::Same,
            stride_w: 1,
            stride_h: 1,
            depth_multiplier: 1,
            dilation_w: 1,
            dilation_h: 1,
            activation: Activation::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool2DParams {
    pub padding: Padding,
    pub stride_w: u32,
    pub stride_h: u32,
    pub filter_w: u32,
    pub filter_h: u32,
    pub activation: Activation,
}

impl Default for Pool2DParams {
    fn default() -> Self {
        Pool2DParams {
            padding: Padding::Same,
            stride_w: 1,
            stride_h: 1,
            filter_w: 1,
            filter_h: 1,
            activation: Activation::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftmaxParams {
    pub beta: f32,
}

impl Default for SoftmaxParams {
    fn default() -> Self {
        SoftmaxParams { beta: 1.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ElementwiseParams {
    pub activation: Activation,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReshapeParams {
    pub new_shape: Vec<i32>,
}

/// Parsed builtin operator parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum BuiltinData {
    FullyConnected(FullyConnectedParams),
    Conv2D(Conv2DParams),
    DepthwiseConv2D(DepthwiseConv2DParams),
    Pool2D(Pool2DParams),
    Softmax(SoftmaxParams),
    Add(ElementwiseParams),
    Mul(ElementwiseParams),
    Reshape(ReshapeParams),
}

impl BuiltinData {
    /// Encode back to the serialized option bytes (tooling and fixtures).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            BuiltinData::FullyConnected(p) => {
                push_u32(&mut out, p.activation.code());
                push_u32(&mut out, p.keep_num_dims as u32);
            }
            BuiltinData::Conv2D(p) => {
                push_u32(&mut out, p.padding.code());
                push_u32(&mut out, p.stride_w);
                push_u32(&mut out, p.stride_h);
                push_u32(&mut out, p.dilation_w);
                push_u32(&mut out, p.dilation_h);
                push_u32(&mut out, p.activation.code());
            }
            BuiltinData::DepthwiseConv2D(p) => {
                push_u32(&mut out, p.padding.code());
                push_u32(&mut out, p.stride_w);
                push_u32(&mut out, p.stride_h);
                push_u32(&mut out, p.depth_multiplier);
                push_u32(&mut out, p.dilation_w);
                push_u32(&mut out, p.dilation_h);
                push_u32(&mut out, p.activation.code());
            }
            BuiltinData::Pool2D(p) => {
                push_u32(&mut out, p.padding.code());
                push_u32(&mut out, p.stride_w);
                push_u32(&mut out, p.stride_h);
                push_u32(&mut out, p.filter_w);
                push_u32(&mut out, p.filter_h);
                push_u32(&mut out, p.activation.code());
            }
            BuiltinData::Softmax(p) => {
                out.extend_from_slice(&p.beta.to_le_bytes());
            }
            BuiltinData::Add(p) | BuiltinData::Mul(p) => {
                push_u32(&mut out, p.activation.code());
            }
            BuiltinData::Reshape(p) => {
                push_u32(&mut out, p.new_shape.len() as u32);
                for dim in &p.new_shape {
                    out.extend_from_slice(&dim.to_le_bytes());
                }
            }
        }
        out
    }
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Little-endian cursor over builtin option bytes.
struct OptionReader<'b> {
    bytes: &'b [u8],
    at: usize,
}

impl<'b> OptionReader<'b> {
    fn new(bytes: &'b [u8]) -> Self {
        OptionReader { bytes, at: 0 }
    }

    fn read_u32(&mut self) -> ForgeResult<u32> {
        if self.at + 4 > self.bytes.len() {
            return Err(MicroForgeError::InvalidModelFile(
                "builtin options truncated".to_string(),
            ));
        }
        let word = u32::from_le_bytes([
            self.bytes[self.at],
            self.bytes[self.at + 1],
            self.bytes[self.at + 2],
            self.bytes[self.at + 3],
        ]);
        self.at += 4;
        Ok(word)
    }

    fn read_i32(&mut self) -> ForgeResult<i32> {
        Ok(self.read_u32()? as i32)
    }

    fn read_f32(&mut self) -> ForgeResult<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }
}

/// Parser signature for builtin operator options. Empty bytes produce the
/// operator's default parameters.
pub type BuiltinParser = fn(&[u8]) -> ForgeResult<BuiltinData>;

pub fn parse_fully_connected(bytes: &[u8]) -> ForgeResult<BuiltinData> {
    if bytes.is_empty() {
        return Ok(BuiltinData::FullyConnected(FullyConnectedParams::default()));
    }
    let mut r = OptionReader::new(bytes);
    Ok(BuiltinData::FullyConnected(FullyConnectedParams {
        activation: Activation::from_code(r.read_u32()?)?,
        keep_num_dims: r.read_u32()? != 0,
    }))
}

pub fn parse_conv_2d(bytes: &[u8]) -> ForgeResult<BuiltinData> {
    if bytes.is_empty() {
        return Ok(BuiltinData::Conv2D(Conv2DParams::default()));
    }
    let mut r = OptionReader::new(bytes);
    Ok(BuiltinData::Conv2D(Conv2DParams {
        padding: Padding::from_code(r.read_u32()?)?,
        stride_w: r.read_u32()?,
        stride_h: r.read_u32()?,
        dilation_w: r.read_u32()?,
        dilation_h: r.read_u32()?,
        activation: Activation::from_code(r.read_u32()?)?,
    }))
}

pub fn parse_depthwise_conv_2d(bytes: &[u8]) -> ForgeResult<BuiltinData> {
    if bytes.is_empty() {
        return Ok(BuiltinData::DepthwiseConv2D(
            DepthwiseConv2DParams::default(),
        ));
    }
    let mut r = OptionReader::new(bytes);
    Ok(BuiltinData::DepthwiseConv2D(DepthwiseConv2DParams {
        padding: Padding::from_code(r.read_u32()?)?,
        stride_w: r.read_u32()?,
        stride_h: r.read_u32()?,
        depth_multiplier: r.read_u32()?,
        dilation_w: r.read_u32()?,
        dilation_h: r.read_u32()?,
        activation: Activation::from_code(r.read_u32()?)?,
    }))
}

pub fn parse_pool_2d(bytes: &[u8]) -> ForgeResult<BuiltinData> {
    if bytes.is_empty() {
        return Ok(BuiltinData::Pool2D(Pool2DParams::default()));
    }
    let mut r = OptionReader::new(bytes);
    Ok(BuiltinData::Pool2D(Pool2DParams {
        padding: Padding::from_code(r.read_u32()?)?,
        stride_w: r.read_u32()?,
        stride_h: r.read_u32()?,
        filter_w: r.read_u32()?,
        filter_h: r.read_u32()?,
        activation: Activation::from_code(r.read_u32()?)?,
    }))
}

pub fn parse_softmax(bytes: &[u8]) -> ForgeResult<BuiltinData> {
    if bytes.is_empty() {
        return Ok(BuiltinData::Softmax(SoftmaxParams::default()));
    }
    let mut r = OptionReader::new(bytes);
    Ok(BuiltinData::Softmax(SoftmaxParams {
        beta: r.read_f32()?,
    }))
}

pub fn parse_add(bytes: &[u8]) -> ForgeResult<BuiltinData> {
    if bytes.is_empty() {
        return Ok(BuiltinData::Add(ElementwiseParams::default()));
    }
    let mut r = OptionReader::new(bytes);
    Ok(BuiltinData::Add(ElementwiseParams {
        activation: Activation::from_code(r.read_u32()?)?,
    }))
}

pub fn parse_mul(bytes: &[u8]) -> ForgeResult<BuiltinData> {
    if bytes.is_empty() {
        return Ok(BuiltinData::Mul(ElementwiseParams::default()));
    }
    let mut r = OptionReader::new(bytes);
    Ok(BuiltinData::Mul(ElementwiseParams {
        activation: Activation::from_code(r.read_u32()?)?,
    }))
}

pub fn parse_reshape(bytes: &[u8]) -> ForgeResult<BuiltinData> {
    if bytes.is_empty() {
        return Ok(BuiltinData::Reshape(ReshapeParams::default()));
    }
    let mut r = OptionReader::new(bytes);
    let count = r.read_u32()? as usize;
    let mut new_shape = Vec::with_capacity(count);
    for _ in 0..count {
        new_shape.push(r.read_i32()?);
    }
    Ok(BuiltinData::Reshape(ReshapeParams { new_shape }))
}

/// Default option parser for a builtin operator, if one exists.
pub fn default_parser(op: BuiltinOperator) -> Option<BuiltinParser> {
    match op {
        BuiltinOperator::FullyConnected => Some(parse_fully_connected),
        BuiltinOperator::Conv2D => Some(parse_conv_2d),
        BuiltinOperator::DepthwiseConv2D => Some(parse_depthwise_conv_2d),
        BuiltinOperator::MaxPool2D | BuiltinOperator::AveragePool2D => Some(parse_pool_2d),
        BuiltinOperator::Softmax => Some(parse_softmax),
        BuiltinOperator::Add => Some(parse_add),
        BuiltinOperator::Mul => Some(parse_mul),
        BuiltinOperator::Reshape => Some(parse_reshape),
        BuiltinOperator::Custom => None,
    }
}

/// Kernel registration resolved for an operator.
///
/// The kernel entry points themselves are owned by the inference loop; the
/// allocator core only needs the identity to attach to each node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRegistration {
    pub op: BuiltinOperator,
    pub custom_name: Option<&'static str>,
}

impl OpRegistration {
    /// Registration for a builtin operator.
    pub fn builtin(op: BuiltinOperator) -> Self {
        OpRegistration {
            op,
            custom_name: None,
        }
    }

    /// Registration for a custom operator resolved by name.
    pub fn custom(name: &'static str) -> Self {
        OpRegistration {
            op: BuiltinOperator::Custom,
            custom_name: Some(name),
        }
    }
}

/// Kernel lookup interface the allocator consumes during operator
/// preparation.
pub trait OpResolver {
    /// Registration for a builtin operator, if registered.
    fn find_builtin(&self, op: BuiltinOperator) -> Option<&OpRegistration>;

    /// Registration for a custom operator, looked up by name.
    fn find_custom(&self, name: &str) -> Option<&OpRegistration>;

    /// Option parser for a builtin operator, if registered.
    fn builtin_parser(&self, op: BuiltinOperator) -> Option<BuiltinParser>;
}

/// Mutable registration table for the operators a firmware image links in.
#[derive(Debug, Default)]
pub struct MicroOpResolver {
    registrations: Vec<OpRegistration>,
    parsers: Vec<(BuiltinOperator, BuiltinParser)>,
}

impl MicroOpResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a builtin operator with its default option parser.
    pub fn register_builtin(&mut self, op: BuiltinOperator) -> &mut Self {
        self.registrations.push(OpRegistration::builtin(op));
        if let Some(parser) = default_parser(op) {
            self.parsers.push((op, parser));
        }
        debug!(op = op.name(), "registered builtin operator");
        self
    }

    /// Register a builtin operator with a caller-supplied option parser.
    pub fn register_builtin_with_parser(
        &mut self,
        op: BuiltinOperator,
        parser: BuiltinParser,
    ) -> &mut Self {
        self.registrations.push(OpRegistration::builtin(op));
        self.parsers.push((op, parser));
        self
    }

    /// Register a custom operator by name.
    pub fn register_custom(&mut self, name: &'static str) -> &mut Self {
        self.registrations.push(OpRegistration::custom(name));
        debug!(op = name, "registered custom operator");
        self
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// True if nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl OpResolver for MicroOpResolver {
    fn find_builtin(&self, op: BuiltinOperator) -> Option<&OpRegistration> {
        self.registrations
            .iter()
            .find(|r| r.op == op && r.custom_name.is_none())
    }

    fn find_custom(&self, name: &str) -> Option<&OpRegistration> {
        self.registrations
            .iter()
            .find(|r| r.custom_name == Some(name))
    }

    fn builtin_parser(&self, op: BuiltinOperator) -> Option<BuiltinParser> {
        self.parsers
            .iter()
            .find(|(candidate, _)| *candidate == op)
            .map(|(_, parser)| *parser)
    }
}

/// Per-operator runtime record: parsed parameters plus tensor index lists.
#[derive(Debug, Clone)]
pub struct Node<'m> {
    pub inputs: IntArray<'m>,
    pub outputs: IntArray<'m>,
    pub builtin_data: Option<BuiltinData>,
    pub custom_data: Option<&'m [u8]>,
}

/// Per-operator bundle handed to the inference loop.
#[derive(Debug, Clone)]
pub struct NodeAndRegistration<'m> {
    pub node: Node<'m>,
    pub registration: OpRegistration,
}
