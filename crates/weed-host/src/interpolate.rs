//! Parameter values between recorded changes.
//!
//! A parameter's timeline is a list of [`ParamChange`]s in timecode order.
//! Each element of a (possibly multi-valued) parameter is evaluated on its
//! own: numbers and colours move linearly between the surrounding changes,
//! switches, text and choice lists hold the last recorded value.

use weed_plant::{keys, LeafValue};

use crate::filter::ParamTemplate;
use crate::instance::Instance;
use crate::{flags, FilterError, FilterResult, FilterStatus};

/// One recorded parameter change.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamChange {
    pub timecode: i64,
    pub value: LeafValue,
    /// Elements this change leaves alone.
    pub ignore: Vec<bool>,
}

impl ParamChange {
    pub fn new(timecode: i64, value: impl Into<LeafValue>) -> Self {
        Self {
            timecode,
            value: value.into(),
            ignore: Vec::new(),
        }
    }

    pub fn ignoring(mut self, ignore: Vec<bool>) -> Self {
        self.ignore = ignore;
        self
    }

    fn covers(&self, element: usize, width: usize) -> bool {
        (element + 1) * width <= self.value.len() && !self.ignore.get(element).copied().unwrap_or(false)
    }
}

/// The changes around `timecode` that set `element`.
fn anchors(
    changes: &[ParamChange],
    element: usize,
    width: usize,
    timecode: i64,
) -> (Option<&ParamChange>, Option<&ParamChange>) {
    let last = changes
        .iter()
        .filter(|change| change.timecode <= timecode && change.covers(element, width))
        .last();
    let next = changes
        .iter()
        .find(|change| change.timecode > timecode && change.covers(element, width));
    (last, next)
}

fn numbers(value: &LeafValue) -> Option<Vec<f64>> {
    match value {
        LeafValue::Int(values) => Some(values.iter().map(|&v| v as f64).collect()),
        LeafValue::Double(values) => Some(values.clone()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Curve {
    Linear { width: usize },
    Hold,
}

fn curve_for(template: &ParamTemplate) -> Curve {
    match template.param_type() {
        flags::PARAM_FLOAT => Curve::Linear { width: 1 },
        flags::PARAM_INTEGER if !template.has_choices() => Curve::Linear { width: 1 },
        flags::PARAM_COLOR => Curve::Linear {
            width: template.color_components(),
        },
        _ => Curve::Hold,
    }
}

fn linear(
    current: &[f64],
    defaults: &[f64],
    changes: &[ParamChange],
    len: usize,
    width: usize,
    timecode: i64,
) -> Option<Vec<f64>> {
    let default = |k: usize| {
        defaults
            .get(k)
            .or(defaults.get(k % width))
            .or(defaults.last())
            .copied()
    };
    let mut out: Vec<f64> = Vec::with_capacity(len);
    for element in 0..len / width {
        let (last, next) = anchors(changes, element, width, timecode);
        for c in 0..width {
            let k = element * width + c;
            let value = match (last, next) {
                (None, None) => current.get(k).copied().or(out.last().copied()),
                (None, Some(_)) => default(k),
                (Some(last), None) => numbers(&last.value).and_then(|v| v.get(k).copied()),
                (Some(last), Some(next)) => {
                    let from = numbers(&last.value)?.get(k).copied()?;
                    let to = numbers(&next.value)?.get(k).copied()?;
                    let span = (next.timecode - last.timecode) as f64;
                    let t = (timecode - last.timecode) as f64 / span;
                    Some(from + (to - from) * t)
                }
            };
            out.push(value.or(out.last().copied())?);
        }
    }
    Some(out)
}

fn hold<T: Clone>(
    current: &[T],
    defaults: &[T],
    changes: &[ParamChange],
    len: usize,
    timecode: i64,
    elements: impl Fn(&LeafValue) -> Option<&[T]>,
) -> Option<Vec<T>> {
    let mut out: Vec<T> = Vec::with_capacity(len);
    for element in 0..len {
        let value = match anchors(changes, element, 1, timecode) {
            (Some(last), _) => elements(&last.value).and_then(|v| v.get(element).cloned()),
            (None, Some(_)) => defaults.get(element).or(defaults.last()).cloned(),
            (None, None) => current.get(element).cloned(),
        };
        let value = value.or_else(|| out.last().cloned())?;
        out.push(value);
    }
    Some(out)
}

/// The value of a parameter at `timecode`, given its current value and its
/// recorded changes in timecode order. Values grow to the length of the
/// first change, padded from their last element.
pub fn interpolate(
    template: &ParamTemplate,
    current: &LeafValue,
    changes: &[ParamChange],
    timecode: i64,
) -> Result<LeafValue, FilterError> {
    if current.is_empty() {
        return Err(FilterError::InterpolationFailed);
    }
    let Some(first) = changes.first() else {
        return Ok(current.clone());
    };
    let len = current.len().max(first.value.len());
    let defaults = template
        .default_value()
        .unwrap_or_else(|| LeafValue::empty(current.seed_type()));

    let value = match (curve_for(template), current) {
        (Curve::Linear { width }, LeafValue::Int(_) | LeafValue::Double(_)) => {
            if len % width != 0 {
                return Ok(current.clone());
            }
            let current_numbers = numbers(current).unwrap_or_default();
            let default_numbers = numbers(&defaults).unwrap_or_default();
            linear(&current_numbers, &default_numbers, changes, len, width, timecode).map(|values| {
                match current {
                    LeafValue::Int(_) => LeafValue::Int(values.iter().map(|v| v.round() as i32).collect()),
                    _ => LeafValue::Double(values),
                }
            })
        }
        (_, LeafValue::Int(values)) => hold(values, ints(&defaults), changes, len, timecode, |v| match v {
            LeafValue::Int(v) => Some(v.as_slice()),
            _ => None,
        })
        .map(LeafValue::Int),
        (_, LeafValue::Double(values)) => {
            let defaults = numbers(&defaults).unwrap_or_default();
            hold(values, &defaults, changes, len, timecode, |v| match v {
                LeafValue::Double(v) => Some(v.as_slice()),
                _ => None,
            })
            .map(LeafValue::Double)
        }
        (_, LeafValue::Boolean(values)) => {
            let defaults = match &defaults {
                LeafValue::Boolean(v) => v.as_slice(),
                _ => &[],
            };
            hold(values, defaults, changes, len, timecode, |v| match v {
                LeafValue::Boolean(v) => Some(v.as_slice()),
                _ => None,
            })
            .map(LeafValue::Boolean)
        }
        (_, LeafValue::String(values)) => {
            let defaults = match &defaults {
                LeafValue::String(v) => v.as_slice(),
                _ => &[],
            };
            hold(values, defaults, changes, len, timecode, |v| match v {
                LeafValue::String(v) => Some(v.as_slice()),
                _ => None,
            })
            .map(LeafValue::String)
        }
        _ => None,
    };
    value.ok_or(FilterError::InterpolationFailed)
}

fn ints(value: &LeafValue) -> &[i32] {
    match value {
        LeafValue::Int(v) => v.as_slice(),
        _ => &[],
    }
}

/// Set every input parameter of `instance` to its value at `timecode`.
/// `timeline[i]` holds the changes of parameter `i`; parameters without
/// changes keep their value.
pub fn interpolate_params(
    instance: &Instance,
    timeline: &[Vec<ParamChange>],
    timecode: i64,
) -> FilterResult {
    for (param, changes) in instance.in_params().iter().zip(timeline) {
        if changes.is_empty() {
            continue;
        }
        let template = param
            .plant(keys::TEMPLATE)
            .map(ParamTemplate::new)
            .ok_or(FilterError::InvalidInstance)?;
        let current = param
            .read()
            .value(keys::VALUE)
            .cloned()
            .ok_or(FilterError::InterpolationFailed)?;
        let value = interpolate(&template, &current, changes, timecode)?;
        param
            .write()
            .force_set(keys::VALUE, value)
            .map_err(|_| FilterError::InterpolationFailed)?;
    }
    Ok(FilterStatus::Success)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use weed_plant::{Plant, PlantHandle, PlantType};

    use super::*;
    use crate::instance::LiveCounter;
    use crate::testing::{param_template, FakeCallbacks, FilterBuilder};

    fn template(param_type: i32, default: impl Into<LeafValue>) -> ParamTemplate {
        ParamTemplate::new(param_template("p", param_type, default))
    }

    #[test]
    fn floats_default_then_ramp_then_hold() {
        let template = template(flags::PARAM_FLOAT, 2.5f64);
        let changes = vec![ParamChange::new(10, 0.0f64), ParamChange::new(20, 10.0f64)];
        let current = LeafValue::from(1.0f64);
        let at = |tc| interpolate(&template, &current, &changes, tc).unwrap();
        assert_eq!(at(5), LeafValue::from(2.5f64));
        assert_eq!(at(10), LeafValue::from(0.0f64));
        assert_eq!(at(15), LeafValue::from(5.0f64));
        assert_eq!(at(25), LeafValue::from(10.0f64));
    }

    #[test]
    fn integers_round_to_nearest() {
        let template = template(flags::PARAM_INTEGER, 0i32);
        let changes = vec![ParamChange::new(0, 0i32), ParamChange::new(3, 10i32)];
        let current = LeafValue::from(0i32);
        assert_eq!(interpolate(&template, &current, &changes, 1), Ok(LeafValue::from(3i32)));
        assert_eq!(interpolate(&template, &current, &changes, 2), Ok(LeafValue::from(7i32)));
    }

    #[test]
    fn choice_lists_hold_their_value() {
        let handle = param_template("mode", flags::PARAM_INTEGER, 1i32);
        let mut gui = Plant::new(PlantType::Gui);
        gui.set(keys::CHOICES, vec!["a", "b", "c"]).unwrap();
        handle.set(keys::GUI, PlantHandle::from_plant(gui)).unwrap();
        let template = ParamTemplate::new(handle);
        let changes = vec![ParamChange::new(10, 0i32), ParamChange::new(20, 2i32)];
        let current = LeafValue::from(1i32);
        assert_eq!(interpolate(&template, &current, &changes, 5), Ok(LeafValue::from(1i32)));
        assert_eq!(interpolate(&template, &current, &changes, 19), Ok(LeafValue::from(0i32)));
        assert_eq!(interpolate(&template, &current, &changes, 20), Ok(LeafValue::from(2i32)));
    }

    #[test]
    fn switches_and_text_snap() {
        let switch = template(flags::PARAM_SWITCH, false);
        let changes = vec![ParamChange::new(10, true), ParamChange::new(20, false)];
        let current = LeafValue::from(false);
        assert_eq!(interpolate(&switch, &current, &changes, 15), Ok(LeafValue::from(true)));

        let text = template(flags::PARAM_TEXT, "none");
        let changes = vec![ParamChange::new(10, "hello"), ParamChange::new(20, "world")];
        let current = LeafValue::from("x");
        assert_eq!(interpolate(&text, &current, &changes, 0), Ok(LeafValue::from("none")));
        assert_eq!(interpolate(&text, &current, &changes, 19), Ok(LeafValue::from("hello")));
    }

    #[test]
    fn colours_move_per_component() {
        let template = template(flags::PARAM_COLOR, vec![0i32, 0, 0]);
        let changes = vec![
            ParamChange::new(0, vec![0i32, 0, 0]),
            ParamChange::new(100, vec![255i32, 100, 50]),
        ];
        let current = LeafValue::from(vec![0i32, 0, 0]);
        assert_eq!(
            interpolate(&template, &current, &changes, 50),
            Ok(LeafValue::from(vec![128i32, 50, 25]))
        );
    }

    #[test]
    fn ignored_elements_hold_while_others_move() {
        let template = template(flags::PARAM_FLOAT, 0.0f64);
        let changes = vec![
            ParamChange::new(0, vec![0.0f64, 0.0, 0.0]),
            ParamChange::new(10, vec![10.0f64, 99.0, 10.0]).ignoring(vec![false, true, false]),
        ];
        let current = LeafValue::from(vec![1.0f64, 2.0]);
        assert_eq!(
            interpolate(&template, &current, &changes, 5),
            Ok(LeafValue::from(vec![5.0f64, 0.0, 5.0]))
        );
    }

    #[test]
    fn grown_values_pad_from_the_last_element() {
        let template = template(flags::PARAM_FLOAT, 0.0f64);
        let changes = vec![ParamChange::new(100, vec![1.0f64, 1.0, 1.0])];
        let current = LeafValue::from(vec![7.0f64]);
        // every element only has a later change, so all take the default
        assert_eq!(
            interpolate(&template, &current, &changes, 0),
            Ok(LeafValue::from(vec![0.0f64, 0.0, 0.0]))
        );
        let changes = vec![ParamChange::new(0, vec![4.0f64])];
        let current = LeafValue::from(vec![7.0f64, 8.0, 9.0]);
        assert_eq!(
            interpolate(&template, &current, &changes, 10),
            Ok(LeafValue::from(vec![4.0f64, 8.0, 9.0]))
        );
    }

    #[test]
    fn empty_values_cannot_be_interpolated() {
        let template = template(flags::PARAM_FLOAT, 0.0f64);
        let changes = vec![ParamChange::new(0, 1.0f64)];
        assert_eq!(
            interpolate(&template, &LeafValue::Double(Vec::new()), &changes, 0),
            Err(FilterError::InterpolationFailed)
        );
    }

    #[test]
    fn instance_parameters_follow_the_timeline() {
        let filter = FilterBuilder::new("fade")
            .float_param("amount", 0.0)
            .bool_param("invert", false)
            .register(Arc::new(FakeCallbacks::default()));
        let instance = Instance::create(&filter, &LiveCounter::default()).unwrap();
        let timeline = vec![
            vec![ParamChange::new(0, 0.0f64), ParamChange::new(40, 1.0f64)],
            Vec::new(),
        ];
        assert_eq!(interpolate_params(&instance, &timeline, 10), Ok(FilterStatus::Success));
        assert_eq!(instance.param_value(0), Some(LeafValue::from(0.25f64)));
        assert_eq!(instance.param_value(1), Some(LeafValue::from(false)));
    }

    proptest! {
        #[test]
        fn ramps_stay_between_their_ends(
            from in -1000.0f64..1000.0,
            to in -1000.0f64..1000.0,
            span in 1i64..10_000,
            at in 0i64..10_000,
        ) {
            let template = template(flags::PARAM_FLOAT, 0.0f64);
            let changes = vec![ParamChange::new(0, from), ParamChange::new(span, to)];
            let value = interpolate(&template, &LeafValue::from(0.0f64), &changes, at.min(span)).unwrap();
            let LeafValue::Double(values) = value else {
                panic!("float parameter produced {value:?}");
            };
            let (lo, hi) = if from < to { (from, to) } else { (to, from) };
            prop_assert!(values[0] >= lo - 1e-9 && values[0] <= hi + 1e-9);
        }
    }
}
