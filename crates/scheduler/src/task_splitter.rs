// task_splitter.rs
// 任务拆分器：把分区规格绑定到调用参数，产出按下标排列、带计时的惰性分区流。
//
// 被分区的参数由分区源逐块产出，其余参数原样传给每个分区。
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::estimator::EstimatorHandle;
use crate::partition::{check_arity, PartitionChunk, PartitionSource, PartitionStrategy};
use crate::types::{FunctionSignature, NamedArgs};

/// 分区规格：哪些参数被哪个策略拆分
#[derive(Clone)]
pub enum PartitionSpec {
    /// 一个策略拆分全部参数，按签名顺序传入
    AllArguments(Arc<dyn PartitionStrategy>),
    /// 每个参数各自一个策略，各分区源按步对齐
    PerArgument(Vec<(String, Arc<dyn PartitionStrategy>)>),
    /// 一个策略拆分指定的参数子集
    MultipleArguments(Vec<String>, Arc<dyn PartitionStrategy>),
}

impl PartitionSpec {
    pub fn all<S: PartitionStrategy + 'static>(strategy: S) -> Self {
        PartitionSpec::AllArguments(Arc::new(strategy))
    }

    pub fn arguments<N, S>(names: impl IntoIterator<Item = N>, strategy: S) -> Self
    where
        N: Into<String>,
        S: PartitionStrategy + 'static,
    {
        PartitionSpec::MultipleArguments(names.into_iter().map(Into::into).collect(), Arc::new(strategy))
    }

    pub fn per_argument<N: Into<String>>(
        entries: impl IntoIterator<Item = (N, Arc<dyn PartitionStrategy>)>,
    ) -> Self {
        PartitionSpec::PerArgument(
            entries
                .into_iter()
                .map(|(name, strategy)| (name.into(), strategy))
                .collect(),
        )
    }

    /// 是否包含自定义策略
    pub fn is_custom(&self) -> bool {
        match self {
            PartitionSpec::AllArguments(s) | PartitionSpec::MultipleArguments(_, s) => s.is_custom(),
            PartitionSpec::PerArgument(entries) => entries.iter().any(|(_, s)| s.is_custom()),
        }
    }

    /// 对照函数签名校验规格，返回被分区的参数名（分区元组的顺序）
    pub fn validate(&self, signature: &FunctionSignature) -> Result<Vec<String>> {
        let names: Vec<String> = match self {
            PartitionSpec::AllArguments(strategy) => {
                let names = signature.params().to_vec();
                check_arity(strategy.as_ref(), names.len())?;
                names
            }
            PartitionSpec::MultipleArguments(names, strategy) => {
                check_arity(strategy.as_ref(), names.len())?;
                names.clone()
            }
            PartitionSpec::PerArgument(entries) => {
                if entries.is_empty() {
                    return Err(Error::Config("按参数分区的规格至少需要一个参数".to_string()));
                }
                for (_, strategy) in entries {
                    check_arity(strategy.as_ref(), 1)?;
                }
                entries.iter().map(|(name, _)| name.clone()).collect()
            }
        };

        for (i, name) in names.iter().enumerate() {
            if !signature.contains(name) {
                return Err(Error::UnknownArgument(format!(
                    "分区规格引用了函数签名中不存在的参数 `{}`",
                    name
                )));
            }
            if names[..i].contains(name) {
                return Err(Error::Config(format!("参数 `{}` 被分区了多次", name)));
            }
        }
        Ok(names)
    }

    fn open(&self, owned: &NamedArgs) -> Result<Box<dyn PartitionSource>> {
        match self {
            PartitionSpec::AllArguments(strategy) | PartitionSpec::MultipleArguments(_, strategy) => {
                strategy.partition(owned)
            }
            PartitionSpec::PerArgument(entries) => {
                let mut sources = Vec::with_capacity(entries.len());
                for (name, strategy) in entries {
                    let (single, _) = owned.split(std::slice::from_ref(name))?;
                    sources.push(strategy.partition(&single)?);
                }
                Ok(Box::new(ZipSource { sources }))
            }
        }
    }
}

/// 把多个分区源按步对齐，在最短的源结束时停止。
///
/// 只要有一个源按大小切分，整个组合就按请求的大小拉取，不按大小切分的源各自决定粒度。
struct ZipSource {
    sources: Vec<Box<dyn PartitionSource>>,
}

impl PartitionSource for ZipSource {
    fn next_partition(&mut self, requested: usize) -> Option<Result<PartitionChunk>> {
        let mut chunks = Vec::with_capacity(self.sources.len());
        let mut aware_size: Option<usize> = None;
        for source in &mut self.sources {
            let chunk = match source.next_partition(requested)? {
                Ok(chunk) => chunk,
                Err(e) => return Some(Err(e)),
            };
            if source.is_size_aware() {
                match aware_size {
                    Some(size) if size != chunk.size => {
                        return Some(Err(Error::PartitionArity(format!(
                            "按参数对齐的分区大小不一致: {} 与 {}",
                            size, chunk.size
                        ))))
                    }
                    _ => aware_size = Some(chunk.size),
                }
            }
            chunks.push(chunk);
        }

        let size = aware_size
            .or_else(|| chunks.first().map(|c| c.size))
            .unwrap_or(0);
        let values = chunks.into_iter().flat_map(|c| c.values).collect();
        Some(Ok(PartitionChunk { size, values }))
    }

    fn is_size_aware(&self) -> bool {
        self.sources.iter().any(|s| s.is_size_aware())
    }
}

/// 分区大小的来源
#[derive(Clone)]
pub enum Sizing {
    /// 固定大小，不使用估计器
    Fixed(usize),
    /// 由估计器推荐；`initial` 在估计器仍在学习时作为本次调用第一个分区的大小
    Estimated {
        estimator: EstimatorHandle,
        initial: Option<usize>,
    },
    /// 分区源自行决定粒度（自定义策略等），请求的大小被忽略
    Unsized,
}

/// 分区流产出的一个分区
#[derive(Debug, Clone)]
pub struct PartitionItem {
    pub index: usize,
    /// 分区参数与未分区参数合并后的完整参数，按签名顺序排列
    pub args: NamedArgs,
    pub size: usize,
    pub requested_size: Option<usize>,
    /// 生成该分区的耗时（纳秒）
    pub partition_ns: u64,
}

/// 惰性、有限、不可重启的分区流
pub struct PartitionStream {
    order: Vec<String>,
    names: Vec<String>,
    rest: NamedArgs,
    source: Box<dyn PartitionSource>,
    sizing: Sizing,
    next_index: usize,
    done: bool,
}

impl PartitionStream {
    /// 当前使用的估计器，自定义策略或固定大小时为 None
    pub fn estimator(&self) -> Option<&EstimatorHandle> {
        match &self.sizing {
            Sizing::Estimated { estimator, .. } => Some(estimator),
            _ => None,
        }
    }

    pub fn sizing(&self) -> &Sizing {
        &self.sizing
    }

    fn requested_size(&self) -> Option<usize> {
        match &self.sizing {
            Sizing::Fixed(size) => Some(*size),
            Sizing::Estimated { estimator, initial } => match initial {
                Some(size) if self.next_index == 0 && estimator.coefficients().is_none() => {
                    Some(*size)
                }
                _ => Some(estimator.estimate().value),
            },
            Sizing::Unsized => None,
        }
    }

    fn pull(&mut self) -> Option<Result<PartitionItem>> {
        let start = Instant::now();
        let requested = self.requested_size();
        let chunk = match self.source.next_partition(requested.unwrap_or(1))? {
            Ok(chunk) => chunk,
            Err(e) => return Some(Err(e)),
        };
        if chunk.values.len() != self.names.len() {
            return Some(Err(Error::PartitionArity(format!(
                "分区 {} 产出了 {} 个参数，期望 {} 个 ({})",
                self.next_index,
                chunk.values.len(),
                self.names.len(),
                self.names.join(", ")
            ))));
        }

        let partitioned = NamedArgs::from_pairs(&self.names, chunk.values);
        let args = self.rest.merge(&partitioned).reordered(&self.order);
        let item = PartitionItem {
            index: self.next_index,
            args,
            size: chunk.size,
            requested_size: requested,
            partition_ns: start.elapsed().as_nanos() as u64,
        };
        self.next_index += 1;
        Some(Ok(item))
    }
}

impl Iterator for PartitionStream {
    type Item = Result<PartitionItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.pull();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}

/// 任务拆分器：函数签名 + 已校验的分区规格
#[derive(Clone)]
pub struct TaskSplitter {
    signature: FunctionSignature,
    spec: PartitionSpec,
    partitioned: Vec<String>,
}

impl TaskSplitter {
    /// 创建拆分器，在配置阶段校验规格
    pub fn new(signature: FunctionSignature, spec: PartitionSpec) -> Result<Self> {
        let partitioned = spec.validate(&signature)?;
        Ok(Self {
            signature,
            spec,
            partitioned,
        })
    }

    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }

    pub fn partitioned_names(&self) -> &[String] {
        &self.partitioned
    }

    pub fn is_custom(&self) -> bool {
        self.spec.is_custom()
    }

    /// 校验并规范化调用参数
    pub fn bind(&self, args: NamedArgs) -> Result<NamedArgs> {
        self.signature.bind(args)
    }

    /// 为一次调用创建分区流。含自定义策略或没有任何按大小切分的分区源时忽略 `sizing`
    pub fn split(&self, args: NamedArgs, sizing: Sizing) -> Result<PartitionStream> {
        let bound = self.bind(args)?;
        let (owned, rest) = bound.split(&self.partitioned)?;
        let source = self.spec.open(&owned)?;
        let sizing = if self.is_custom() || !source.is_size_aware() {
            Sizing::Unsized
        } else {
            sizing
        };
        Ok(PartitionStream {
            order: self.signature.params().to_vec(),
            names: self.partitioned.clone(),
            rest,
            source,
            sizing,
            next_index: 0,
            done: false,
        })
    }
}
