//! Calling a filter's process function, optionally split across threads.
//!
//! A filter that may thread gets its output channels cut into horizontal
//! bands. Each worker sees a copy of the instance plant whose output
//! channels point into the same frame memory at a row offset, with the
//! band height and `offset` leaves adjusted; input channels are shared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use weed_plant::{keys, LeafValue, Palette, Plant, PlantHandle, VoidPtr};

use crate::filter::ChannelTemplate;
use crate::handles;
use crate::instance::Instance;
use crate::PluginCode;

fn lcm2(step: usize) -> usize {
    if step % 2 == 0 {
        step
    } else {
        step * 2
    }
}

/// Row ranges `(offset, height)` for `threads` bands of `height` rows,
/// each but the last a multiple of `align`. `None` when fewer than two
/// bands would result.
pub fn plan_slices(height: usize, threads: usize, align: usize) -> Option<Vec<(usize, usize)>> {
    let align = align.max(1);
    if threads < 2 || height < 2 * align {
        return None;
    }
    let band = height.div_ceil(threads).div_ceil(align) * align;
    if band >= height {
        return None;
    }
    Some(
        (0..height)
            .step_by(band)
            .map(|offset| (offset, band.min(height - offset)))
            .collect(),
    )
}

struct OutGeometry {
    channel: PlantHandle,
    palette: Palette,
    rowstrides: Vec<usize>,
    planes: Vec<VoidPtr>,
}

fn out_geometry(instance: &Instance) -> Option<(usize, usize, Vec<OutGeometry>)> {
    let class = instance.filter().class();
    let mut height = None;
    let mut vstep = class
        .handle()
        .read()
        .get_int(keys::VSTEP)
        .ok()
        .and_then(|step| usize::try_from(step).ok())
        .unwrap_or(1)
        .max(1);
    let mut outs = Vec::new();
    for channel in instance.out_channels() {
        let plant = channel.read();
        if plant.is_true(keys::DISABLED) {
            continue;
        }
        let template = ChannelTemplate::new(plant.get_plant(keys::TEMPLATE).ok()?);
        if template.is_audio() {
            return None;
        }
        if let Some(step) = template.int(keys::VSTEP).and_then(|s| usize::try_from(s).ok()) {
            vstep = vstep.max(step);
        }
        let h = usize::try_from(plant.get_int(keys::HEIGHT).ok()?).ok()?;
        if *height.get_or_insert(h) != h {
            return None;
        }
        let rowstrides = plant
            .get_ints(keys::ROWSTRIDES)
            .ok()?
            .iter()
            .map(|&s| usize::try_from(s).ok())
            .collect::<Option<Vec<usize>>>()?;
        outs.push(OutGeometry {
            palette: Palette::from_code(plant.get_int(keys::CURRENT_PALETTE).ok()?)?,
            rowstrides,
            planes: plant.get_voidptrs(keys::PIXEL_DATA).ok()?.to_vec(),
            channel: channel.clone(),
        });
    }
    Some((height?, lcm2(vstep), outs))
}

fn force_set(plant: &mut Plant, key: &str, value: impl Into<LeafValue>) {
    if let Err(err) = plant.force_set(key, value) {
        tracing::debug!(?err, key, "could not set slice leaf");
    }
}

fn slice_channel(out: &OutGeometry, offset: usize, height: usize) -> PlantHandle {
    let mut plant: Plant = out.channel.read().clone();
    let planes: Vec<VoidPtr> = out
        .planes
        .iter()
        .zip(&out.rowstrides)
        .enumerate()
        .map(|(plane, (ptr, stride))| ptr.offset(out.palette.plane_rows(offset, plane) * stride))
        .collect();
    force_set(&mut plant, keys::PIXEL_DATA, planes);
    force_set(&mut plant, keys::HEIGHT, height as i32);
    force_set(&mut plant, keys::OFFSET, offset as i32);
    PlantHandle::from_plant(plant)
}

/// Run one frame of `instance`, on `threads` workers when the filter
/// allows it and the outputs can be cut into bands. The instance's random
/// seed is consumed by the call.
pub fn process(instance: &Instance, timecode: i64, threads: usize) -> PluginCode {
    let code = dispatch(instance, timecode, threads);
    instance.plant().write().remove(keys::RANDOM_SEED);
    code
}

fn dispatch(instance: &Instance, timecode: i64, threads: usize) -> PluginCode {
    if instance.is_compound() || threads < 2 || !instance.filter().class().may_thread() {
        return instance.process(timecode);
    }
    let Some((height, align, outs)) = out_geometry(instance) else {
        return instance.process(timecode);
    };
    let Some(slices) = plan_slices(height, threads, align).filter(|_| !outs.is_empty()) else {
        return instance.process(timecode);
    };
    process_sliced(instance, timecode, &slices, &outs)
}

fn process_sliced(
    instance: &Instance,
    timecode: i64,
    slices: &[(usize, usize)],
    outs: &[OutGeometry],
) -> PluginCode {
    let stateful = instance.state_updates_enabled();
    let mut slice_channels = Vec::with_capacity(slices.len() * outs.len());
    let plants: Vec<PlantHandle> = slices
        .iter()
        .enumerate()
        .map(|(idx, &(offset, height))| {
            let mut plant: Plant = instance.plant().read().clone();
            let channels: Vec<PlantHandle> = outs
                .iter()
                .map(|out| slice_channel(out, offset, height))
                .collect();
            slice_channels.extend(channels.iter().cloned());
            force_set(&mut plant, keys::OUT_CHANNELS, channels);
            if stateful {
                force_set(&mut plant, keys::STATE_UPDATED, idx != 0);
            }
            PlantHandle::from_plant(plant)
        })
        .collect();

    let callbacks = instance.filter().callbacks();
    let first = &plants[0];
    let first_done = AtomicBool::new(false);
    let run = |idx: usize| {
        let plant = &plants[idx];
        if idx == 0 {
            let code = callbacks.process(plant, timecode);
            first_done.store(true, Ordering::Release);
            return code;
        }
        if stateful {
            while !first.bool_or(keys::STATE_UPDATED, false) {
                if first_done.load(Ordering::Acquire) {
                    if !first.bool_or(keys::STATE_UPDATED, false) {
                        instance.disable_state_updates();
                    }
                    break;
                }
                thread::yield_now();
            }
        }
        callbacks.process(plant, timecode)
    };

    let run = &run;
    let code = thread::scope(|scope| {
        let mut workers = Vec::with_capacity(plants.len());
        let mut inline = PluginCode::Success;
        for idx in 0..plants.len() {
            let spawned = thread::Builder::new()
                .name(format!("weed-slice-{idx}"))
                .spawn_scoped(scope, move || run(idx));
            match spawned {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    tracing::warn!(%err, "could not spawn slice worker, running inline");
                    inline = inline.merge(run(idx));
                }
            }
        }
        workers.into_iter().fold(inline, |code, worker| {
            code.merge(worker.join().unwrap_or(PluginCode::FilterInvalid))
        })
    });
    // Slice plants die with this frame; drop any addresses a plugin saw.
    let table = handles::table();
    for plant in plants.iter().chain(&slice_channels) {
        table.release(plant.as_ptr());
    }
    tracing::trace!(slices = slices.len(), ?code, "sliced process finished");
    code
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use weed_plant::FrameBuffer;

    use super::*;
    use crate::convert::BasicConverter;
    use crate::instance::LiveCounter;
    use crate::layer::Layer;
    use crate::negotiate::Negotiator;
    use crate::callbacks::FilterCallbacks;
    use crate::testing::{FakeCallbacks, FakeEffect, FilterBuilder};
    use crate::flags;

    #[test]
    fn bands_follow_alignment() {
        assert_eq!(plan_slices(100, 4, 2), Some(vec![(0, 26), (26, 26), (52, 26), (78, 22)]));
        assert_eq!(plan_slices(64, 4, 16), Some(vec![(0, 16), (16, 16), (32, 16), (48, 16)]));
        assert_eq!(plan_slices(10, 4, 8), None);
        assert_eq!(plan_slices(100, 1, 2), None);
    }

    fn gradient_layer(width: usize, height: usize) -> Layer {
        let mut frame = FrameBuffer::new(Palette::Rgb24, width, height, 1);
        for y in 0..height {
            for (x, byte) in frame.row_mut(0, y).iter_mut().enumerate() {
                *byte = ((x * 7 + y * 13) % 251) as u8;
            }
        }
        Layer::from_frame(frame)
    }

    fn invert_with(threads: usize) -> FrameBuffer {
        let callbacks = Arc::new(FakeCallbacks::new(FakeEffect::Invert));
        let filter = FilterBuilder::new("invert")
            .flags(flags::FILTER_HINT_MAY_THREAD)
            .register(callbacks.clone());
        let instance = Instance::create(&filter, &LiveCounter::default()).unwrap();
        instance.init().unwrap();
        let converter = BasicConverter;
        let negotiator = Negotiator {
            threads,
            ..Negotiator::new(&converter)
        };
        let mut layers = vec![gradient_layer(40, 30)];
        negotiator.apply(&instance, &mut layers, None, None, 0).unwrap();
        let expected_calls = if threads > 1 { threads } else { 1 };
        assert_eq!(FakeCallbacks::count(&callbacks.processed), expected_calls);
        layers[0].take_frame().unwrap()
    }

    #[test]
    fn threaded_output_matches_single_threaded() {
        let single = invert_with(1);
        let sliced = invert_with(3);
        assert_eq!(single, sliced);
        assert_eq!(single.row(0, 29)[0], 255 - ((29 * 13) % 251) as u8);
    }

    #[test]
    fn only_the_first_slice_updates_state() {
        let callbacks = Arc::new(FakeCallbacks::new(FakeEffect::Fill(1)).stateful());
        let filter = FilterBuilder::generator("noise")
            .flags(flags::FILTER_HINT_MAY_THREAD)
            .register(callbacks.clone());
        let instance = Instance::create(&filter, &LiveCounter::default()).unwrap();
        instance.init().unwrap();
        let out = instance.out_channels()[0].clone();
        out.set(keys::WIDTH, 16).unwrap();
        out.set(keys::HEIGHT, 64).unwrap();
        let converter = BasicConverter;
        let negotiator = Negotiator {
            threads: 4,
            ..Negotiator::new(&converter)
        };
        let layer = negotiator.run_generator(&instance, 0).unwrap();
        assert_eq!(FakeCallbacks::count(&callbacks.processed), 4);
        assert_eq!(FakeCallbacks::count(&callbacks.state_updates), 1);
        assert!(instance.state_updates_enabled());
        assert!(layer.frame().unwrap().row(0, 63).iter().all(|&b| b == 1));
    }

    #[test]
    fn filters_without_the_hint_run_once() {
        let callbacks = Arc::new(FakeCallbacks::new(FakeEffect::Fill(2)));
        let filter = FilterBuilder::generator("flat").register(callbacks.clone());
        let instance = Instance::create(&filter, &LiveCounter::default()).unwrap();
        instance.init().unwrap();
        assert!(instance.plant().has_leaf(keys::RANDOM_SEED));
        assert_eq!(process(&instance, 0, 8), PluginCode::Success);
        assert_eq!(FakeCallbacks::count(&callbacks.processed), 1);
        assert!(!instance.plant().has_leaf(keys::RANDOM_SEED));
    }

    #[test]
    fn worst_slice_result_wins() {
        let callbacks = Arc::new(FakeCallbacks::new(FakeEffect::Nothing));
        let filter = FilterBuilder::generator("broken")
            .flags(flags::FILTER_HINT_MAY_THREAD)
            .register(callbacks.clone());
        let instance = Instance::create(&filter, &LiveCounter::default()).unwrap();
        instance.init().unwrap();
        let mut frame = FrameBuffer::new(Palette::Rgb24, 8, 32, 16);
        let out = instance.out_channels()[0].clone();
        {
            let mut plant = out.write();
            plant.force_set(keys::CURRENT_PALETTE, Palette::Rgb24.code()).unwrap();
            plant.force_set(keys::WIDTH, 8).unwrap();
            plant.force_set(keys::HEIGHT, 32).unwrap();
            plant.force_set(keys::ROWSTRIDES, vec![32]).unwrap();
            plant.force_set(keys::PIXEL_DATA, frame.plane_ptrs()).unwrap();
        }
        callbacks.set_process_error(Some(PluginCode::ReinitNeeded));
        assert_eq!(process(&instance, 0, 4), PluginCode::ReinitNeeded);
        assert_eq!(FakeCallbacks::count(&callbacks.processed), 4);
    }

    /// Hands its instance and output channels to the address table the
    /// way a native plugin's leaf reads would.
    #[derive(Default)]
    struct Exposing {
        seen: Mutex<Vec<PlantHandle>>,
    }

    impl FilterCallbacks for Exposing {
        fn process(&self, instance: &PlantHandle, _timecode: i64) -> PluginCode {
            let mut seen = self.seen.lock();
            handles::expose(instance);
            seen.push(instance.clone());
            for channel in instance.plants(keys::OUT_CHANNELS) {
                handles::expose(&channel);
                seen.push(channel);
            }
            PluginCode::Success
        }
    }

    fn prepared_generator(callbacks: Arc<dyn FilterCallbacks>, height: i32) -> (Instance, FrameBuffer) {
        let filter = FilterBuilder::generator("exposed")
            .flags(flags::FILTER_HINT_MAY_THREAD)
            .register(callbacks);
        let instance = Instance::create(&filter, &LiveCounter::default()).unwrap();
        instance.init().unwrap();
        let mut frame = FrameBuffer::new(Palette::Rgb24, 32, 64, 16);
        let out = instance.out_channels()[0].clone();
        {
            let mut plant = out.write();
            plant.force_set(keys::CURRENT_PALETTE, Palette::Rgb24.code()).unwrap();
            plant.force_set(keys::WIDTH, 32).unwrap();
            plant.force_set(keys::HEIGHT, height).unwrap();
            plant.force_set(keys::ROWSTRIDES, vec![frame.rowstrides()[0] as i32]).unwrap();
            plant.force_set(keys::PIXEL_DATA, frame.plane_ptrs()).unwrap();
        }
        (instance, frame)
    }

    #[test]
    fn slice_plants_leave_no_addresses_behind() {
        let callbacks = Arc::new(Exposing::default());
        let (instance, _frame) = prepared_generator(callbacks.clone(), 64);
        for _ in 0..50 {
            assert_eq!(process(&instance, 0, 4), PluginCode::Success);
        }
        let seen = callbacks.seen.lock();
        assert_eq!(seen.len(), 50 * 4 * 2);
        // The recorded clones keep every address from being reused.
        assert!(seen.iter().all(|plant| !handles::table().contains(plant.as_ptr())));
    }

    #[test]
    fn negative_geometry_is_not_sliced() {
        let callbacks = Arc::new(Exposing::default());
        let (instance, _frame) = prepared_generator(callbacks.clone(), -64);
        assert_eq!(process(&instance, 0, 4), PluginCode::Success);
        assert_eq!(callbacks.seen.lock().len(), 2);

        let (instance, _frame) = prepared_generator(callbacks.clone(), 64);
        instance.out_channels()[0]
            .write()
            .force_set(keys::ROWSTRIDES, vec![-96])
            .unwrap();
        assert_eq!(process(&instance, 0, 4), PluginCode::Success);
        assert_eq!(callbacks.seen.lock().len(), 4);
    }
}
