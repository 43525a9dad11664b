//! The fuel-stop planner.
//!
//! Given the stations projected onto a route (ordered by distance from the
//! start) and the total route length, decide where to stop and how many
//! gallons to buy at each stop. The decision loop is a pure function over
//! the projected-station list, which is what makes it testable without a
//! store: the corridor query and projection happen in `db::stations`, and
//! everything here is arithmetic.
//!
//! The algorithm is a greedy heuristic with two safety rules, not a proof
//! of global optimality:
//!
//! 1. Only stop at "safe" stations: ones from which the destination or at
//!    least one further station is reachable on a full tank. This avoids
//!    driving into a dead end with an empty tank.
//! 2. At the pump, buy just enough to reach the first strictly-cheaper
//!    station ahead, if one is reachable on a full tank; otherwise buy
//!    enough to finish, or fill up.

use crate::errors::PlanError;

/// Vehicle fuel economy in miles per gallon.
pub const VEHICLE_MPG: f64 = 10.0;

/// Maximum distance on a full tank, in miles.
pub const MAX_RANGE_MILES: f64 = 500.0;

/// Tank capacity implied by the range and economy: 50 gallons.
pub const TANK_CAPACITY_GALLONS: f64 = MAX_RANGE_MILES / VEHICLE_MPG;

/// A candidate station projected onto the route.
#[derive(Clone, Debug)]
pub struct RouteStation {
    pub opis_id: i32,
    pub name: String,
    pub address: String,
    pub city: String,
    pub state: String,
    /// WGS84 latitude.
    pub lat: f64,
    /// WGS84 longitude.
    pub lon: f64,
    pub price_per_gallon: f64,
    /// Distance from the route start, in miles, derived from the station's
    /// perpendicular projection onto the route line.
    pub dist_from_start: f64,
}

/// One refueling event in the plan.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct PlanStop {
    pub station_id: i32,
    pub name: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub lat: f64,
    pub lon: f64,
    pub price_per_gallon: f64,
    /// Rounded to one decimal.
    pub miles_from_start: f64,
    /// Rounded to two decimals.
    pub gallons_purchased: f64,
    /// Rounded to two decimals.
    pub stop_cost: f64,
}

/// A complete fuel plan.
#[derive(Clone, Debug, serde::Serialize)]
pub struct FuelPlan {
    pub stops: Vec<PlanStop>,
    pub total_gallons: f64,
    pub total_cost: f64,
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Plan fuel stops along a route.
///
/// `stations` must be ordered by `dist_from_start` (the corridor query
/// returns them ordered by projection fraction). The tank starts full.
pub fn plan_fuel_stops(
    stations: &[RouteStation],
    total_distance_miles: f64,
) -> Result<FuelPlan, PlanError> {
    let destination = total_distance_miles;
    let mut pos = 0.0;
    let mut fuel_miles = MAX_RANGE_MILES;
    let mut stops: Vec<PlanStop> = Vec::new();

    loop {
        // Can we reach the destination on what's in the tank?
        if fuel_miles >= destination - pos {
            break;
        }

        let max_reach = pos + fuel_miles;
        let reachable: Vec<&RouteStation> = stations
            .iter()
            .filter(|s| s.dist_from_start > pos && s.dist_from_start <= max_reach)
            .collect();
        if reachable.is_empty() {
            return Err(PlanError::PlanningInfeasible(
                "No stations within range to continue trip.".to_owned(),
            ));
        }

        // A reachable station is only safe if, after refueling there, the
        // destination or some further station is itself within one tank.
        let safe_choices: Vec<&RouteStation> = reachable
            .into_iter()
            .filter(|c| {
                let cand_reach = c.dist_from_start + MAX_RANGE_MILES;
                cand_reach >= destination
                    || stations.iter().any(|s| {
                        s.dist_from_start > c.dist_from_start
                            && s.dist_from_start <= cand_reach
                    })
            })
            .collect();
        let stop = match cheapest(&safe_choices) {
            Some(stop) => stop,
            None => {
                return Err(PlanError::PlanningInfeasible(
                    "No safe reachable stations found (dead-end detected).".to_owned(),
                ));
            }
        };

        // Drive there.
        fuel_miles -= stop.dist_from_start - pos;
        pos = stop.dist_from_start;

        // Size the purchase. Look ahead one full tank for the first station
        // strictly cheaper than this one; equal prices never trigger a jump.
        let cheaper_target = stations.iter().find(|s| {
            s.dist_from_start > pos
                && s.dist_from_start <= pos + MAX_RANGE_MILES
                && s.price_per_gallon < stop.price_per_gallon
        });

        let gallons = if let Some(cheaper) = cheaper_target {
            let need_miles = cheaper.dist_from_start - pos;
            (need_miles - fuel_miles).max(0.0) / VEHICLE_MPG
        } else if destination - pos <= MAX_RANGE_MILES {
            ((destination - pos) - fuel_miles).max(0.0) / VEHICLE_MPG
        } else {
            TANK_CAPACITY_GALLONS - fuel_miles / VEHICLE_MPG
        };

        let cost = gallons * stop.price_per_gallon;
        stops.push(PlanStop {
            station_id: stop.opis_id,
            name: stop.name.clone(),
            address: stop.address.clone(),
            city: stop.city.clone(),
            state: stop.state.clone(),
            lat: stop.lat,
            lon: stop.lon,
            price_per_gallon: stop.price_per_gallon,
            miles_from_start: round1(pos),
            gallons_purchased: round2(gallons),
            stop_cost: round2(cost),
        });

        fuel_miles += gallons * VEHICLE_MPG;
    }

    let total_cost = round2(stops.iter().map(|s| s.stop_cost).sum());
    let total_gallons = round2(stops.iter().map(|s| s.gallons_purchased).sum());
    Ok(FuelPlan {
        stops,
        total_gallons,
        total_cost,
    })
}

/// The cheapest of `choices`, ties broken by first position (ie, nearest,
/// since callers pass stations in distance order).
fn cheapest<'a>(choices: &[&'a RouteStation]) -> Option<&'a RouteStation> {
    let mut best: Option<&'a RouteStation> = None;
    for &c in choices {
        match best {
            Some(b) if c.price_per_gallon >= b.price_per_gallon => {}
            _ => best = Some(c),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station(opis_id: i32, dist: f64, price: f64) -> RouteStation {
        RouteStation {
            opis_id,
            name: format!("Station {}", opis_id),
            address: "I-80".to_owned(),
            city: "Somewhere".to_owned(),
            state: "NE".to_owned(),
            lat: 41.0,
            lon: -100.0,
            price_per_gallon: price,
            dist_from_start: dist,
        }
    }

    #[test]
    fn short_trip_needs_no_stops() {
        let plan = plan_fuel_stops(&[], 400.0).unwrap();
        assert!(plan.stops.is_empty());
        assert_eq!(plan.total_cost, 0.0);
        assert_eq!(plan.total_gallons, 0.0);
    }

    #[test]
    fn thousand_mile_trip_with_three_stations() {
        // 1,000 miles; cheap at 200, expensive at 600, cheap-ish at 800.
        let stations = vec![
            station(1, 200.0, 2.00),
            station(2, 600.0, 4.00),
            station(3, 800.0, 2.10),
        ];
        let plan = plan_fuel_stops(&stations, 1000.0).unwrap();

        // At mile 200 nothing cheaper than $2.00 is within a tank, and the
        // finish is out of range, so we fill up (30 gal on board, buy 20).
        // At mile 600 the $2.10 station is a cheaper target 200 miles out
        // with 100 miles on board, so we buy just 10 gallons of the $4.00
        // fuel. The last 200 miles are bought at mile 800.
        assert_eq!(plan.stops.len(), 3);
        assert_eq!(plan.stops[0].station_id, 1);
        assert_eq!(plan.stops[0].gallons_purchased, 20.0);
        assert_eq!(plan.stops[0].stop_cost, 40.0);
        assert_eq!(plan.stops[1].station_id, 2);
        assert_eq!(plan.stops[1].gallons_purchased, 10.0);
        assert_eq!(plan.stops[1].stop_cost, 40.0);
        assert_eq!(plan.stops[2].station_id, 3);
        assert_eq!(plan.stops[2].gallons_purchased, 20.0);
        assert_eq!(plan.stops[2].stop_cost, 42.0);
        assert_eq!(plan.total_gallons, 50.0);
        assert_eq!(plan.total_cost, 122.0);
    }

    #[test]
    fn fails_when_first_station_is_out_of_range() {
        let stations = vec![station(1, 600.0, 2.50)];
        let err = plan_fuel_stops(&stations, 1000.0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "No stations within range to continue trip."
        );
    }

    #[test]
    fn detects_dead_end() {
        // The only reachable station strands us: nothing else within a tank
        // of it, and the destination is two tanks away.
        let stations = vec![station(1, 100.0, 2.50)];
        let err = plan_fuel_stops(&stations, 1000.0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "No safe reachable stations found (dead-end detected)."
        );
    }

    #[test]
    fn picks_cheapest_safe_station() {
        let stations = vec![station(1, 100.0, 3.00), station(2, 300.0, 2.50)];
        let plan = plan_fuel_stops(&stations, 700.0).unwrap();
        assert_eq!(plan.stops.len(), 1);
        assert_eq!(plan.stops[0].station_id, 2);
        // 200 miles of fuel left at mile 300, 400 to go: buy 20 gallons.
        assert_eq!(plan.stops[0].gallons_purchased, 20.0);
        assert_eq!(plan.stops[0].stop_cost, 50.0);
    }

    #[test]
    fn equal_prices_never_trigger_a_jump() {
        // Both stations cost the same; the cheaper-ahead rule uses strict
        // less-than, so at mile 100 we just buy what the trip needs.
        let stations = vec![station(1, 100.0, 3.00), station(2, 200.0, 3.00)];
        let plan = plan_fuel_stops(&stations, 550.0).unwrap();
        assert_eq!(plan.stops.len(), 1);
        assert_eq!(plan.stops[0].station_id, 1);
        assert_eq!(plan.stops[0].gallons_purchased, 5.0);
    }

    #[test]
    fn price_ties_prefer_the_nearer_station() {
        let stations = vec![station(1, 100.0, 3.00), station(2, 400.0, 3.00)];
        let plan = plan_fuel_stops(&stations, 900.0).unwrap();
        assert_eq!(plan.stops[0].station_id, 1);
    }

    #[test]
    fn buys_just_enough_to_reach_cheaper_fuel() {
        let stations = vec![station(1, 400.0, 3.50), station(2, 700.0, 2.00)];
        let plan = plan_fuel_stops(&stations, 1100.0).unwrap();
        // At mile 400 with 100 miles on board, the $2.00 station is 300
        // miles ahead: buy 20 gallons, no more.
        assert_eq!(plan.stops[0].station_id, 1);
        assert_eq!(plan.stops[0].gallons_purchased, 20.0);
        // Finish the trip from the cheap station.
        assert_eq!(plan.stops[1].station_id, 2);
        assert_eq!(plan.stops[1].gallons_purchased, 40.0);
        assert_eq!(plan.total_gallons, 60.0);
        assert_eq!(plan.total_cost, round2(20.0 * 3.50 + 40.0 * 2.00));
    }

    #[test]
    fn stops_strictly_increase_and_gaps_stay_within_range() {
        let stations = vec![
            station(1, 150.0, 3.10),
            station(2, 340.0, 2.80),
            station(3, 460.0, 3.40),
            station(4, 720.0, 2.60),
            station(5, 980.0, 3.00),
            station(6, 1150.0, 2.90),
        ];
        let total = 1400.0;
        let plan = plan_fuel_stops(&stations, total).unwrap();
        assert!(!plan.stops.is_empty());
        let mut last = 0.0;
        for stop in &plan.stops {
            assert!(stop.miles_from_start > last);
            assert!(stop.miles_from_start - last <= MAX_RANGE_MILES);
            last = stop.miles_from_start;
        }
        assert!(total - last <= MAX_RANGE_MILES);

        // Totals are consistent with the per-stop figures.
        let cost_sum: f64 = plan.stops.iter().map(|s| s.stop_cost).sum();
        assert!((plan.total_cost - cost_sum).abs() < 0.005);
        for stop in &plan.stops {
            assert!(
                (stop.stop_cost - stop.gallons_purchased * stop.price_per_gallon).abs()
                    < 0.01
            );
        }
    }
}
