#![no_main]

use arbitrary::Arbitrary;
use fsr_reach::{PwlOptions, inverse_cdf_bound, upper_quantile};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct PwlInput {
    accuracy: f64,
    lower_bound: f64,
    max_segments: u16,
    probe: f64,
}

fuzz_target!(|input: PwlInput| {
    let options = PwlOptions {
        accuracy: input.accuracy,
        lower_bound: input.lower_bound,
        max_segments: usize::from(input.max_segments),
        ..PwlOptions::default()
    };
    let Ok(bound) = inverse_cdf_bound(&options) else {
        return;
    };
    if bound.in_domain(input.probe)
        && let Ok(exact) = upper_quantile(input.probe)
    {
        assert!(bound.evaluate(input.probe) >= exact - 1e-9);
    }
});
