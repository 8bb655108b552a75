//! WGSL function library injected into every transition stage.
//!
//! Scripts can call these directly:
//!
//! - `hash(n: u32) -> u32`, `hash2(p: vec2<u32>) -> u32`
//! - `rand(seed: u32) -> f32` in [0, 1), `rand_range(seed, lo, hi) -> f32`
//! - `rand_vec3(seed: u32) -> vec3<f32>` in [-1, 1]^3, `rand_sphere(seed) -> vec3<f32>`
//! - `value_noise2(p: vec2<f32>) -> f32` in [0, 1]
//! - `hsv_to_rgb(h, s, v) -> vec3<f32>`
//! - `wrap_position(p, bounds) -> vec3<f32>`, `bounce(p, v, bounds) -> vec3<f32>`
//! - `attract(p, center, strength) -> vec3<f32>`, `orbit_velocity(p, center, speed) -> vec3<f32>`
//! - `approach(current, goal, rate) -> f32`
//!
//! ```ignore
//! engine.set_script(r#"
//!     let seed = index * 7919u + u32(time * 60.0);
//!     velocityOut[index] = velocity[index] + rand_vec3(seed) * 0.01;
//! "#);
//! ```

/// Integer hashing and random numbers.
pub const RANDOM_WGSL: &[&str] = &[
    r#"fn hash(n: u32) -> u32 {
    var x = n;
    x = x ^ (x >> 16u);
    x = x * 0x7feb352du;
    x = x ^ (x >> 15u);
    x = x * 0x846ca68bu;
    x = x ^ (x >> 16u);
    return x;
}"#,
    r#"fn hash2(p: vec2<u32>) -> u32 {
    return hash(p.x ^ hash(p.y));
}"#,
    r#"fn rand(seed: u32) -> f32 {
    return f32(hash(seed) >> 8u) / 16777216.0;
}"#,
    r#"fn rand_range(seed: u32, lo: f32, hi: f32) -> f32 {
    return lo + rand(seed) * (hi - lo);
}"#,
    r#"fn rand_vec3(seed: u32) -> vec3<f32> {
    return vec3<f32>(rand(seed), rand(seed + 1u), rand(seed + 2u)) * 2.0 - 1.0;
}"#,
    r#"fn rand_sphere(seed: u32) -> vec3<f32> {
    let v = rand_vec3(seed);
    let len = length(v);
    if len < 0.0001 {
        return vec3<f32>(0.0, 1.0, 0.0);
    }
    return v / len;
}"#,
];

/// Smooth value noise over an integer lattice.
pub const NOISE_WGSL: &[&str] = &[r#"fn value_noise2(p: vec2<f32>) -> f32 {
    let cell = floor(p);
    let f = fract(p);
    let u = f * f * (3.0 - 2.0 * f);
    let c = vec2<u32>(vec2<i32>(cell) + vec2<i32>(65536));
    let a = rand(hash2(c));
    let b = rand(hash2(c + vec2<u32>(1u, 0u)));
    let d = rand(hash2(c + vec2<u32>(0u, 1u)));
    let e = rand(hash2(c + vec2<u32>(1u, 1u)));
    return mix(mix(a, b, u.x), mix(d, e, u.x), u.y);
}"#];

/// Colour conversion.
pub const COLOR_WGSL: &[&str] = &[r#"fn hsv_to_rgb(h: f32, s: f32, v: f32) -> vec3<f32> {
    let k = vec3<f32>(1.0, 2.0 / 3.0, 1.0 / 3.0);
    let p = abs(fract(vec3<f32>(h) + k) * 6.0 - 3.0);
    return v * mix(vec3<f32>(1.0), clamp(p - 1.0, vec3<f32>(0.0), vec3<f32>(1.0)), vec3<f32>(s));
}"#];

/// Motion helpers for common per-tick updates.
pub const MOTION_WGSL: &[&str] = &[
    r#"fn wrap_position(p: vec3<f32>, bounds: f32) -> vec3<f32> {
    let size = bounds * 2.0;
    return p - size * floor((p + bounds) / size);
}"#,
    r#"fn bounce(p: vec3<f32>, v: vec3<f32>, bounds: f32) -> vec3<f32> {
    var out = v;
    if abs(p.x) > bounds && sign(p.x) == sign(v.x) { out.x = -v.x; }
    if abs(p.y) > bounds && sign(p.y) == sign(v.y) { out.y = -v.y; }
    if abs(p.z) > bounds && sign(p.z) == sign(v.z) { out.z = -v.z; }
    return out;
}"#,
    r#"fn attract(p: vec3<f32>, center: vec3<f32>, strength: f32) -> vec3<f32> {
    let d = center - p;
    let dist2 = max(dot(d, d), 0.0001);
    return d * inverseSqrt(dist2) * strength / dist2;
}"#,
    r#"fn orbit_velocity(p: vec3<f32>, center: vec3<f32>, speed: f32) -> vec3<f32> {
    let r = p - center;
    let tangent = cross(vec3<f32>(0.0, 1.0, 0.0), r);
    let len = length(tangent);
    if len < 0.0001 {
        return vec3<f32>(0.0);
    }
    return tangent / len * speed;
}"#,
    r#"fn approach(current: f32, goal: f32, rate: f32) -> f32 {
    return current + (goal - current) * clamp(rate, 0.0, 1.0);
}"#,
];

/// Every library function, in dependency order.
pub fn library() -> impl Iterator<Item = &'static str> {
    RANDOM_WGSL
        .iter()
        .chain(NOISE_WGSL)
        .chain(COLOR_WGSL)
        .chain(MOTION_WGSL)
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_validates() {
        let mut source: String = library().collect::<Vec<_>>().join("\n\n");
        source.push_str(
            r#"
@group(2) @binding(0) var<storage, read_write> result: array<vec4<f32>>;
@compute @workgroup_size(1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let p = rand_sphere(id.x) + vec3<f32>(value_noise2(vec2<f32>(0.5)));
    let v = bounce(wrap_position(p, 1.0), attract(p, vec3<f32>(0.0), 1.0), 1.0)
        + orbit_velocity(p, vec3<f32>(0.0), 2.0);
    result[id.x] = vec4<f32>(hsv_to_rgb(rand_range(id.x, 0.0, 1.0), 1.0, 1.0) + v, approach(0.0, 1.0, 0.5));
}
"#,
        );
        let module = naga::front::wgsl::parse_str(&source)
            .unwrap_or_else(|e| panic!("{}", e.emit_to_string(&source)));
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .unwrap_or_else(|e| panic!("{}", e.emit_to_string(&source)));
    }

    #[test]
    fn test_functions_are_separate_entries() {
        for function in library() {
            assert!(function.starts_with("fn "));
            assert_eq!(function.matches("\nfn ").count(), 0);
        }
    }
}
