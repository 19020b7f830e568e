//! Stop ordering: a nearest-neighbour route builder plus the structural edits
//! (append, splice, swap) applied to a schedule's stop list.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use wcm_core::{GeoPoint, Stop, StopId};

pub const EARTH_RADIUS_KM: f64 = 6371.0088;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouteError {
    #[error("stop {0} is not on the route")]
    UnknownStop(StopId),
    #[error("stop {0} has no coordinates")]
    Unlocated(StopId),
}

/// The only shape the optimizer needs from a stop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoutePoint {
    pub id: Uuid,
    pub lat: f64,
    pub lng: f64,
}

impl RoutePoint {
    fn geo(&self) -> GeoPoint {
        GeoPoint {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutePlan {
    pub order: Vec<Uuid>,
    /// Distance of each hop, `legs_km[i]` being `order[i] -> order[i + 1]`.
    pub legs_km: Vec<f64>,
    pub total_km: f64,
}

pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlng = (b.lng - a.lng).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().clamp(0.0, 1.0).asin()
}

fn nearest_neighbour(points: &[RoutePoint], start: usize) -> Vec<usize> {
    let mut visited = vec![false; points.len()];
    let mut order = Vec::with_capacity(points.len());
    let mut current = start;
    visited[current] = true;
    order.push(current);

    while order.len() < points.len() {
        let from = points[current].geo();
        let mut best: Option<(usize, f64)> = None;
        for (idx, point) in points.iter().enumerate() {
            if visited[idx] {
                continue;
            }
            let distance = haversine_km(from, point.geo());
            // strict `<` keeps the earliest input on ties
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((idx, distance));
            }
        }
        let Some((next, _)) = best else { break };
        visited[next] = true;
        order.push(next);
        current = next;
    }
    order
}

/// Greedy order starting at the first point.
pub fn optimize_route(points: &[RoutePoint]) -> Vec<Uuid> {
    if points.is_empty() {
        return Vec::new();
    }
    nearest_neighbour(points, 0)
        .into_iter()
        .map(|idx| points[idx].id)
        .collect()
}

pub fn optimize_route_from(points: &[RoutePoint], start: Uuid) -> Result<Vec<Uuid>, RouteError> {
    let start_idx = points
        .iter()
        .position(|p| p.id == start)
        .ok_or(RouteError::UnknownStop(start))?;
    Ok(nearest_neighbour(points, start_idx)
        .into_iter()
        .map(|idx| points[idx].id)
        .collect())
}

pub fn plan_route(points: &[RoutePoint], start: Option<Uuid>) -> Result<RoutePlan, RouteError> {
    let order = match start {
        Some(id) => optimize_route_from(points, id)?,
        None => optimize_route(points),
    };
    let located = |id: &Uuid| points.iter().find(|p| p.id == *id).map(RoutePoint::geo);
    let legs_km = order
        .windows(2)
        .filter_map(|pair| Some(haversine_km(located(&pair[0])?, located(&pair[1])?)))
        .collect::<Vec<_>>();
    let total_km = legs_km.iter().sum();
    Ok(RoutePlan {
        order,
        legs_km,
        total_km,
    })
}

fn route_points(stops: &[Stop]) -> Vec<RoutePoint> {
    stops
        .iter()
        .filter_map(|s| {
            s.coordinates.map(|c| RoutePoint {
                id: s.id,
                lat: c.lat,
                lng: c.lng,
            })
        })
        .collect()
}

/// Reorders the located stops greedily; unlocated stops follow them in their
/// existing relative order. Without `start` the first located stop leads.
pub fn optimize_stops(stops: &[Stop], start: Option<StopId>) -> Result<Vec<Stop>, RouteError> {
    if let Some(id) = start {
        let stop = stops
            .iter()
            .find(|s| s.id == id)
            .ok_or(RouteError::UnknownStop(id))?;
        if stop.coordinates.is_none() {
            return Err(RouteError::Unlocated(id));
        }
    }

    let points = route_points(stops);
    let order = match start {
        Some(id) => optimize_route_from(&points, id)?,
        None => optimize_route(&points),
    };

    let mut out = Vec::with_capacity(stops.len());
    for id in order {
        if let Some(stop) = stops.iter().find(|s| s.id == id) {
            out.push(stop.clone());
        }
    }
    out.extend(stops.iter().filter(|s| s.coordinates.is_none()).cloned());
    Ok(out)
}

pub fn append_stop(stops: &mut Vec<Stop>, stop: Stop) {
    stops.push(stop);
}

pub fn remove_stop(stops: &mut Vec<Stop>, id: StopId) -> Result<Stop, RouteError> {
    let idx = stops
        .iter()
        .position(|s| s.id == id)
        .ok_or(RouteError::UnknownStop(id))?;
    Ok(stops.remove(idx))
}

pub fn swap_stops(stops: &mut [Stop], a: StopId, b: StopId) -> Result<(), RouteError> {
    let ia = stops
        .iter()
        .position(|s| s.id == a)
        .ok_or(RouteError::UnknownStop(a))?;
    let ib = stops
        .iter()
        .position(|s| s.id == b)
        .ok_or(RouteError::UnknownStop(b))?;
    stops.swap(ia, ib);
    Ok(())
}

/// Polyline through the located stops in current order. Display only.
pub fn route_line(stops: &[Stop]) -> Vec<GeoPoint> {
    stops.iter().filter_map(|s| s.coordinates).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    fn point(id: u128, lat: f64, lng: f64) -> RoutePoint {
        RoutePoint {
            id: Uuid::from_u128(id),
            lat,
            lng,
        }
    }

    fn stop(id: u128, coords: Option<(f64, f64)>) -> Stop {
        Stop {
            id: Uuid::from_u128(id),
            location_name: format!("stop-{id}"),
            location_type: None,
            address: None,
            barangay: None,
            coordinates: coords.map(|(lat, lng)| GeoPoint { lat, lng }),
            request_id: None,
            completed_at: None,
            completed_by: None,
        }
    }

    fn ids(stops: &[Stop]) -> Vec<u128> {
        stops.iter().map(|s| s.id.as_u128()).collect()
    }

    fn random_points(rng: &mut StdRng, n: usize) -> Vec<RoutePoint> {
        (0..n)
            .map(|i| point(i as u128 + 1, rng.gen_range(14.0..15.0), rng.gen_range(120.5..121.5)))
            .collect()
    }

    #[test]
    fn nearest_stop_is_visited_first() {
        let a = point(1, 0.0, 0.0);
        let b = point(2, 0.0, 3.0);
        let c = point(3, 0.0, 1.0);
        assert_eq!(optimize_route(&[a, b, c]), vec![a.id, c.id, b.id]);
    }

    #[test]
    fn ties_are_broken_by_input_order() {
        let origin = point(1, 0.0, 0.0);
        let east = point(2, 0.0, 1.0);
        let west = point(3, 0.0, -1.0);
        assert_eq!(optimize_route(&[origin, east, west])[1], east.id);
        assert_eq!(optimize_route(&[origin, west, east])[1], west.id);
    }

    #[test]
    fn output_is_a_permutation_and_rerunning_is_stable() {
        let mut rng = StdRng::seed_from_u64(7);
        for n in 1..=30 {
            let points = random_points(&mut rng, n);
            let first = optimize_route(&points);

            assert_eq!(first.len(), points.len());
            let unique = first.iter().collect::<HashSet<_>>();
            assert_eq!(unique.len(), points.len());
            assert!(points.iter().all(|p| unique.contains(&p.id)));

            let reordered = first
                .iter()
                .map(|id| *points.iter().find(|p| p.id == *id).unwrap())
                .collect::<Vec<_>>();
            assert_eq!(optimize_route(&reordered), first, "n={n}");
        }
    }

    #[test]
    fn explicit_start_must_be_present() {
        let points = [point(1, 0.0, 0.0), point(2, 0.0, 1.0)];
        assert_eq!(
            optimize_route_from(&points, points[1].id).unwrap(),
            vec![points[1].id, points[0].id]
        );
        let missing = Uuid::from_u128(99);
        assert_eq!(
            optimize_route_from(&points, missing),
            Err(RouteError::UnknownStop(missing))
        );
        assert!(optimize_route(&[]).is_empty());
    }

    #[test]
    fn haversine_matches_known_distances() {
        let one_degree = haversine_km(GeoPoint { lat: 0.0, lng: 0.0 }, GeoPoint { lat: 1.0, lng: 0.0 });
        assert!((one_degree - 111.195).abs() < 0.01, "{one_degree}");
        let same = GeoPoint { lat: 14.6, lng: 121.0 };
        assert_eq!(haversine_km(same, same), 0.0);
    }

    #[test]
    fn plan_reports_leg_distances() {
        let points = [point(1, 0.0, 0.0), point(2, 0.0, 3.0), point(3, 0.0, 1.0)];
        let plan = plan_route(&points, None).unwrap();
        assert_eq!(plan.legs_km.len(), 2);
        assert!((plan.total_km - plan.legs_km.iter().sum::<f64>()).abs() < 1e-9);
        assert!(plan.legs_km[0] < plan.legs_km[1]);
    }

    #[test]
    fn unlocated_stops_trail_the_optimized_ones() {
        let stops = vec![
            stop(1, Some((0.0, 0.0))),
            stop(2, None),
            stop(3, Some((0.0, 3.0))),
            stop(4, None),
            stop(5, Some((0.0, 1.0))),
        ];
        let ordered = optimize_stops(&stops, None).unwrap();
        assert_eq!(ids(&ordered), vec![1, 5, 3, 2, 4]);

        assert_eq!(
            optimize_stops(&stops, Some(Uuid::from_u128(2))),
            Err(RouteError::Unlocated(Uuid::from_u128(2)))
        );
        assert_eq!(ids(&optimize_stops(&stops, Some(Uuid::from_u128(3))).unwrap()), vec![3, 5, 1, 2, 4]);
    }

    #[test]
    fn manual_edits_keep_the_rest_in_place() {
        let mut stops = vec![stop(1, None), stop(2, None), stop(3, None), stop(4, None)];
        append_stop(&mut stops, stop(5, None));
        assert_eq!(ids(&stops), vec![1, 2, 3, 4, 5]);

        let removed = remove_stop(&mut stops, Uuid::from_u128(2)).unwrap();
        assert_eq!(removed.id.as_u128(), 2);
        assert_eq!(ids(&stops), vec![1, 3, 4, 5]);

        swap_stops(&mut stops, Uuid::from_u128(1), Uuid::from_u128(5)).unwrap();
        assert_eq!(ids(&stops), vec![5, 3, 4, 1]);

        assert!(remove_stop(&mut stops, Uuid::from_u128(2)).is_err());
        assert!(swap_stops(&mut stops, Uuid::from_u128(3), Uuid::from_u128(42)).is_err());
        assert_eq!(ids(&stops), vec![5, 3, 4, 1]);
    }

    #[test]
    fn route_line_skips_unlocated_stops() {
        let stops = vec![stop(1, Some((14.5, 121.0))), stop(2, None), stop(3, Some((14.6, 121.1)))];
        assert_eq!(
            route_line(&stops),
            vec![GeoPoint { lat: 14.5, lng: 121.0 }, GeoPoint { lat: 14.6, lng: 121.1 }]
        );
    }
}
