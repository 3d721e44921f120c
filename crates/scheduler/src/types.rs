// types.rs
// 定义通用类型：类型擦除的参数值、按名称绑定的参数集合以及函数签名。
use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// 类型擦除的参数值，克隆代价为一次引用计数
#[derive(Clone)]
pub struct ArgValue {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl ArgValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: type_name::<T>(),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// 按类型取出引用，失败时返回带参数名的类型错误
    pub fn get<T: Any>(&self, name: &str) -> Result<&T> {
        self.downcast_ref::<T>().ok_or_else(|| Error::ArgumentType {
            name: name.to_string(),
            expected: type_name::<T>(),
            actual: self.type_name,
        })
    }
}

impl fmt::Debug for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArgValue<{}>", self.type_name)
    }
}

/// 按名称绑定的调用参数，保持函数签名中的参数顺序
#[derive(Debug, Clone, Default)]
pub struct NamedArgs {
    entries: Vec<(String, ArgValue)>,
}

impl NamedArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加（或替换）一个参数
    pub fn with<T: Any + Send + Sync>(mut self, name: &str, value: T) -> Self {
        self.insert(name, ArgValue::new(value));
        self
    }

    pub fn insert(&mut self, name: &str, value: ArgValue) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn value(&self, name: &str) -> Result<&ArgValue> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| Error::UnknownArgument(name.to_string()))
    }

    /// 按名称和类型读取参数
    pub fn get<T: Any>(&self, name: &str) -> Result<&T> {
        self.value(name)?.get::<T>(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &ArgValue> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 拆分为（被分区的参数, 其余参数），被分区的参数按 `names` 的顺序排列
    pub fn split(&self, names: &[String]) -> Result<(NamedArgs, NamedArgs)> {
        let mut selected = NamedArgs::new();
        for name in names {
            selected.insert(name, self.value(name)?.clone());
        }
        let rest = NamedArgs {
            entries: self
                .entries
                .iter()
                .filter(|(n, _)| !names.contains(n))
                .cloned()
                .collect(),
        };
        Ok((selected, rest))
    }

    /// 用 `other` 中的值覆盖同名参数，新名称追加到末尾
    pub fn merge(&self, other: &NamedArgs) -> NamedArgs {
        let mut merged = self.clone();
        for (name, value) in &other.entries {
            merged.insert(name, value.clone());
        }
        merged
    }

    /// 按给定名称顺序重新排列
    pub(crate) fn reordered(&self, order: &[String]) -> NamedArgs {
        let mut entries = Vec::with_capacity(self.entries.len());
        for name in order {
            if let Some(entry) = self.entries.iter().find(|(n, _)| n == name) {
                entries.push(entry.clone());
            }
        }
        NamedArgs { entries }
    }

    pub(crate) fn from_pairs(names: &[String], values: Vec<ArgValue>) -> NamedArgs {
        NamedArgs {
            entries: names.iter().cloned().zip(values).collect(),
        }
    }
}

/// 被分区函数的参数签名（参数名的有序列表）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSignature {
    params: Vec<String>,
}

impl FunctionSignature {
    pub fn new<I, S>(params: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let params: Vec<String> = params.into_iter().map(Into::into).collect();
        for (i, p) in params.iter().enumerate() {
            if params[..i].contains(p) {
                return Err(Error::Config(format!("参数 `{}` 重复声明", p)));
            }
        }
        Ok(Self { params })
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.iter().any(|p| p == name)
    }

    /// 校验调用参数与签名一致，并按签名顺序返回
    pub fn bind(&self, args: NamedArgs) -> Result<NamedArgs> {
        let missing: Vec<&str> = self
            .params
            .iter()
            .filter(|p| !args.contains(p))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(Error::UnknownArgument(format!(
                "缺少参数: {}",
                missing.join(", ")
            )));
        }
        let unknown: Vec<&str> = args.names().filter(|n| !self.contains(n)).collect();
        if !unknown.is_empty() {
            return Err(Error::UnknownArgument(format!(
                "无效参数: {}",
                unknown.join(", ")
            )));
        }
        Ok(args.reordered(&self.params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access() {
        let args = NamedArgs::new().with("values", vec![1i64, 2, 3]).with("factor", 2i64);
        assert_eq!(args.get::<Vec<i64>>("values").unwrap(), &vec![1, 2, 3]);
        assert!(matches!(
            args.get::<String>("factor"),
            Err(Error::ArgumentType { .. })
        ));
        assert!(matches!(args.get::<i64>("nope"), Err(Error::UnknownArgument(_))));
    }

    #[test]
    fn test_split_and_merge() {
        let args = NamedArgs::new().with("a", 1i32).with("b", 2i32).with("c", 3i32);
        let (owned, rest) = args.split(&["c".to_string(), "a".to_string()]).unwrap();
        assert_eq!(owned.names().collect::<Vec<_>>(), vec!["c", "a"]);
        assert_eq!(rest.names().collect::<Vec<_>>(), vec!["b"]);

        let merged = rest.merge(&owned.clone().with("a", 10i32));
        assert_eq!(*merged.get::<i32>("a").unwrap(), 10);
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_bind_reorders_and_rejects() {
        let sig = FunctionSignature::new(["x", "y"]).unwrap();
        let bound = sig.bind(NamedArgs::new().with("y", 1u8).with("x", 2u8)).unwrap();
        assert_eq!(bound.names().collect::<Vec<_>>(), vec!["x", "y"]);

        assert!(sig.bind(NamedArgs::new().with("x", 1u8)).is_err());
        assert!(sig
            .bind(NamedArgs::new().with("x", 1u8).with("y", 1u8).with("z", 1u8))
            .is_err());
        assert!(FunctionSignature::new(["x", "x"]).is_err());
    }
}
