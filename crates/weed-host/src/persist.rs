//! Per-filter settings that survive a session: user parameter defaults and
//! generator output sizes.
//!
//! Both files are a sequence of records:
//! `[u32 len][hashname][u32 count] {[i32 index][leaf]*}* "\n"`, with leaves
//! in the keyless plant-serialization format. Records for filters that are
//! no longer installed are skipped.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use weed_plant::serialize::{encode_leaf, LeafRecord};
use weed_plant::{keys, Decoder, LeafValue, PlantHandle};

use crate::registry::{FilterRegistry, RegisteredFilter};
use crate::HostError;

const MAX_HASHNAME: usize = 4096;
/// Entry index of the filter-wide `host_fps` record in the sizes file.
const FPS_ENTRY: i32 = -1;

/// Size a generator starts with when nothing usable was saved for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorSize {
    pub width: i32,
    pub height: i32,
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn begin_record(out: &mut Vec<u8>, hashname: &str, count: usize) {
    put_u32(out, hashname.len() as u32);
    out.extend_from_slice(hashname.as_bytes());
    put_u32(out, count as u32);
}

fn end_record(out: &mut Vec<u8>) {
    out.push(b'\n');
}

fn read_value(decoder: &mut Decoder<'_>) -> Result<Option<LeafValue>, HostError> {
    Ok(match decoder.read_leaf_value()? {
        LeafRecord::Value(value) => Some(value),
        LeafRecord::Frame(_) | LeafRecord::Skipped => None,
    })
}

fn read_terminator(decoder: &mut Decoder<'_>) -> Result<(), HostError> {
    match decoder.read_bytes(1)? {
        b"\n" => Ok(()),
        _ => Err(HostError::InvalidState(format!(
            "record not terminated at byte {}",
            decoder.position()
        ))),
    }
}

fn store(plant: &PlantHandle, key: &str, value: LeafValue) {
    if let Err(err) = plant.write().force_set(key, value) {
        tracing::warn!(key, %err, "ignoring saved value");
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), HostError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;
    Ok(())
}

fn read_file(path: &Path) -> Result<Option<Vec<u8>>, HostError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Append the `host_default` values of `filter`'s parameters. Filters
/// without any write nothing.
pub fn write_filter_defaults(out: &mut Vec<u8>, filter: &RegisteredFilter) {
    let entries: Vec<(usize, LeafValue)> = filter
        .class()
        .in_param_templates()
        .iter()
        .enumerate()
        .filter_map(|(idx, template)| {
            let value = template.handle().read().value(keys::HOST_DEFAULT).cloned()?;
            Some((idx, value))
        })
        .collect();
    if entries.is_empty() {
        return;
    }
    begin_record(out, filter.hashname(), entries.len());
    for (idx, value) in &entries {
        out.extend_from_slice(&(*idx as i32).to_le_bytes());
        encode_leaf(out, None, value);
    }
    end_record(out);
}

/// Restore `host_default` values into the templates of registered filters.
/// Returns how many values were applied.
pub fn read_filter_defaults(registry: &FilterRegistry, bytes: &[u8]) -> Result<usize, HostError> {
    let mut decoder = Decoder::new(bytes);
    let mut applied = 0;
    while !decoder.is_empty() {
        let hashname = decoder.read_string(MAX_HASHNAME)?;
        let templates = registry
            .find(&hashname)
            .map(|filter| filter.class().in_param_templates())
            .unwrap_or_default();
        if templates.is_empty() {
            tracing::debug!(%hashname, "skipping defaults of unknown filter");
        }
        let count = decoder.read_u32()?;
        for _ in 0..count {
            let idx = decoder.read_i32()?;
            let value = read_value(&mut decoder)?;
            let template = usize::try_from(idx).ok().and_then(|idx| templates.get(idx));
            if let (Some(template), Some(value)) = (template, value) {
                store(template.handle(), keys::HOST_DEFAULT, value);
                applied += 1;
            }
        }
        read_terminator(&mut decoder)?;
    }
    Ok(applied)
}

pub fn save_defaults(registry: &FilterRegistry, path: &Path) -> Result<(), HostError> {
    let mut out = Vec::new();
    for filter in registry.iter() {
        write_filter_defaults(&mut out, filter);
    }
    write_file(path, &out)
}

/// Missing files restore nothing.
pub fn load_defaults(registry: &FilterRegistry, path: &Path) -> Result<usize, HostError> {
    match read_file(path)? {
        Some(bytes) => read_filter_defaults(registry, &bytes),
        None => Ok(0),
    }
}

fn size_leaf(template: &PlantHandle, host_key: &str, key: &str) -> LeafValue {
    let plant = template.read();
    plant
        .value(host_key)
        .or(plant.value(key))
        .cloned()
        .unwrap_or(LeafValue::Int(vec![0]))
}

/// Append the saved output sizes and frame rate of a generator. Other
/// filters, and generators never resized, write nothing.
pub fn write_generator_sizes(out: &mut Vec<u8>, filter: &RegisteredFilter) {
    let class = filter.class();
    if class.enabled_in_channels(false) != 0 {
        return;
    }
    let templates = class.out_channel_templates();
    let sized: Vec<usize> = templates
        .iter()
        .enumerate()
        .filter(|(_, t)| t.handle().has_leaf(keys::HOST_WIDTH) || t.handle().has_leaf(keys::HOST_HEIGHT))
        .map(|(idx, _)| idx)
        .collect();
    let fps = class.handle().read().value(keys::HOST_FPS).cloned();
    if sized.is_empty() && fps.is_none() {
        return;
    }
    begin_record(out, filter.hashname(), sized.len() + usize::from(fps.is_some()));
    if let Some(fps) = &fps {
        out.extend_from_slice(&FPS_ENTRY.to_le_bytes());
        encode_leaf(out, None, fps);
    }
    for idx in sized {
        let template = templates[idx].handle();
        out.extend_from_slice(&(idx as i32).to_le_bytes());
        encode_leaf(out, None, &size_leaf(template, keys::HOST_WIDTH, keys::WIDTH));
        encode_leaf(out, None, &size_leaf(template, keys::HOST_HEIGHT, keys::HEIGHT));
    }
    end_record(out);
}

/// Restore generator sizes. A saved width or height of zero becomes the
/// matching dimension of `fallback`.
pub fn read_generator_sizes(
    registry: &FilterRegistry,
    bytes: &[u8],
    fallback: GeneratorSize,
) -> Result<usize, HostError> {
    let mut decoder = Decoder::new(bytes);
    let mut applied = 0;
    while !decoder.is_empty() {
        let hashname = decoder.read_string(MAX_HASHNAME)?;
        let filter = registry.find(&hashname);
        let templates = filter
            .map(|filter| filter.class().out_channel_templates())
            .unwrap_or_default();
        let count = decoder.read_u32()?;
        for _ in 0..count {
            let idx = decoder.read_i32()?;
            if idx == FPS_ENTRY {
                let fps = read_value(&mut decoder)?;
                if let (Some(filter), Some(fps)) = (filter, fps) {
                    store(filter.class().handle(), keys::HOST_FPS, fps);
                    applied += 1;
                }
                continue;
            }
            let width = read_value(&mut decoder)?;
            let height = read_value(&mut decoder)?;
            let Some(template) = usize::try_from(idx).ok().and_then(|idx| templates.get(idx)) else {
                continue;
            };
            for (key, value, default) in [
                (keys::HOST_WIDTH, width, fallback.width),
                (keys::HOST_HEIGHT, height, fallback.height),
            ] {
                let value = match value {
                    Some(LeafValue::Int(v)) if v.first().is_some_and(|&n| n > 0) => LeafValue::Int(v),
                    _ => LeafValue::from(default),
                };
                store(template.handle(), key, value);
            }
            applied += 1;
        }
        read_terminator(&mut decoder)?;
    }
    Ok(applied)
}

pub fn save_generator_sizes(registry: &FilterRegistry, path: &Path) -> Result<(), HostError> {
    let mut out = Vec::new();
    for filter in registry.iter() {
        write_generator_sizes(&mut out, filter);
    }
    write_file(path, &out)
}

pub fn load_generator_sizes(
    registry: &FilterRegistry,
    path: &Path,
    fallback: GeneratorSize,
) -> Result<usize, HostError> {
    match read_file(path)? {
        Some(bytes) => read_generator_sizes(registry, &bytes, fallback),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{FakeCallbacks, FilterBuilder};

    const FALLBACK: GeneratorSize = GeneratorSize {
        width: 640,
        height: 480,
    };

    fn registry() -> FilterRegistry {
        let mut registry = FilterRegistry::default();
        let fx = FilterBuilder::new("blur")
            .float_param("radius", 1.0)
            .text_param("label", "");
        registry
            .register("fx.so", fx.build_class(), Arc::new(FakeCallbacks::default()))
            .unwrap();
        registry
            .register(
                "gen.so",
                FilterBuilder::generator("plasma").build_class(),
                Arc::new(FakeCallbacks::default()),
            )
            .unwrap();
        registry
    }

    fn param(registry: &FilterRegistry, idx: usize) -> PlantHandle {
        registry.get(0).unwrap().class().in_param_templates()[idx].handle().clone()
    }

    fn generator_out(registry: &FilterRegistry) -> PlantHandle {
        registry.get(1).unwrap().class().out_channel_templates()[0].handle().clone()
    }

    #[test]
    fn defaults_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weed").join("defaults");
        let before = registry();
        param(&before, 0).set(keys::HOST_DEFAULT, 4.5f64).unwrap();
        param(&before, 1).set(keys::HOST_DEFAULT, "title").unwrap();
        save_defaults(&before, &path).unwrap();

        let after = registry();
        assert_eq!(load_defaults(&after, &path).unwrap(), 2);
        assert_eq!(param(&after, 0).read().get_double(keys::HOST_DEFAULT), Ok(4.5));
        assert_eq!(param(&after, 1).string(keys::HOST_DEFAULT), Some("title".to_string()));
    }

    #[test]
    fn unknown_filters_and_indices_are_skipped() {
        let mut bytes = Vec::new();
        begin_record(&mut bytes, "gonefilter1", 1);
        bytes.extend_from_slice(&0i32.to_le_bytes());
        encode_leaf(&mut bytes, None, &LeafValue::from(3i32));
        end_record(&mut bytes);

        let registry = registry();
        let hashname = registry.get(0).unwrap().hashname().to_string();
        begin_record(&mut bytes, &hashname, 2);
        bytes.extend_from_slice(&7i32.to_le_bytes());
        encode_leaf(&mut bytes, None, &LeafValue::from(1.0f64));
        bytes.extend_from_slice(&0i32.to_le_bytes());
        encode_leaf(&mut bytes, None, &LeafValue::from(2.0f64));
        end_record(&mut bytes);

        assert_eq!(read_filter_defaults(&registry, &bytes).unwrap(), 1);
        assert_eq!(param(&registry, 0).read().get_double(keys::HOST_DEFAULT), Ok(2.0));
    }

    #[test]
    fn missing_files_restore_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        assert_eq!(load_defaults(&registry, &dir.path().join("none")).unwrap(), 0);
        assert_eq!(
            load_generator_sizes(&registry, &dir.path().join("none"), FALLBACK).unwrap(),
            0
        );
    }

    #[test]
    fn truncated_records_are_errors() {
        let registry = registry();
        let mut bytes = Vec::new();
        begin_record(&mut bytes, "x", 1);
        assert!(read_filter_defaults(&registry, &bytes).is_err());
    }

    #[test]
    fn generator_sizes_and_fps_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sizes");
        let before = registry();
        generator_out(&before).set(keys::HOST_WIDTH, 320).unwrap();
        generator_out(&before).set(keys::HOST_HEIGHT, 0).unwrap();
        before
            .get(1)
            .unwrap()
            .class()
            .handle()
            .set(keys::HOST_FPS, 12.5f64)
            .unwrap();
        save_generator_sizes(&before, &path).unwrap();

        let after = registry();
        assert_eq!(load_generator_sizes(&after, &path, FALLBACK).unwrap(), 2);
        let out = generator_out(&after);
        assert_eq!(out.int_or(keys::HOST_WIDTH, 0), 320);
        assert_eq!(out.int_or(keys::HOST_HEIGHT, 0), 480);
        let class = after.get(1).unwrap().class().handle().clone();
        assert_eq!(class.read().get_double(keys::HOST_FPS), Ok(12.5));
    }

    #[test]
    fn only_resized_generators_are_written() {
        let registry = registry();
        let mut out = Vec::new();
        for filter in registry.iter() {
            write_generator_sizes(&mut out, filter);
        }
        assert!(out.is_empty());
        param(&registry, 0).set(keys::HOST_DEFAULT, 1.0f64).unwrap();
        write_generator_sizes(&mut out, registry.get(0).unwrap());
        assert!(out.is_empty());
    }
}
