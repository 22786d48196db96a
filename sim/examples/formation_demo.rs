//! Formation movement demonstration.
//!
//! Run with: cargo run --example formation_demo
//! Set RUST_LOG=debug (or pass --verbose) to see pathfinding and formation logs.

use rts_nav_sim::{logging, FormationPattern, FormationState, SimWorld, UnitKind};

fn main() {
    let verbose = std::env::args().any(|arg| arg == "--verbose");
    logging::init(verbose);

    println!("=== RTS Navigation Core - Formation Demo ===\n");

    let mut sim = SimWorld::new();

    // A wall of buildings between the squad and its destination.
    for (i, z) in [-40.0, -20.0, 0.0, 20.0].into_iter().enumerate() {
        sim.spawn_structure(100 + i as u32, 0.0, z, 12.0, true);
    }
    sim.spawn_resource_node(200, 60.0, 60.0, 15.0, 500);

    let kinds = [
        UnitKind::Striker,
        UnitKind::Heavy,
        UnitKind::Interceptor,
        UnitKind::Striker,
        UnitKind::Interceptor,
        UnitKind::Scout,
    ];
    for (i, kind) in kinds.into_iter().enumerate() {
        let speed = match kind {
            UnitKind::Heavy => 6.0,
            UnitKind::Scout => 14.0,
            _ => 10.0,
        };
        sim.spawn_unit_of_kind(i as u32, 0, kind, -120.0 + (i % 3) as f32 * 8.0, (i / 3) as f32 * 8.0, speed);
    }

    let ids: Vec<u32> = (0..kinds.len() as u32).collect();
    let Some(formation) = sim.order_group_move(&ids, 100.0, 0.0, FormationPattern::Wedge, 20.0) else {
        println!("no formation created");
        return;
    };

    println!("Initial state:");
    print_snapshot(&mut sim);

    // 60 seconds at 20 steps/sec.
    for frame in 0..1200 {
        sim.step(0.05);

        if (frame + 1) % 100 == 0 {
            println!("--- Tick {} (t={:.1}s) ---", sim.current_tick(), sim.current_time());
            print_snapshot(&mut sim);
        }
        if sim.formation_state(formation) == Some(FormationState::Arrived) {
            println!("\nFormation arrived at t={:.1}s", sim.current_time());
            break;
        }
    }

    println!("\n--- Switching to a circle ---\n");
    sim.set_formation_pattern(formation, FormationPattern::Circle);
    for _ in 0..200 {
        sim.step(0.05);
    }
    print_snapshot(&mut sim);

    let stats = sim.pathfinder().stats();
    println!(
        "\nPathfinder: {} searches, {} cache hits, {} failures",
        stats.searches, stats.cache_hits, stats.failures
    );

    println!("\n=== Final State (JSON) ===\n");
    match sim.snapshot().to_json_pretty() {
        Ok(json) => println!("{}", json),
        Err(err) => eprintln!("snapshot serialization failed: {}", err),
    }
}

fn print_snapshot(sim: &mut SimWorld) {
    let snapshot = sim.snapshot();

    for formation in &snapshot.formations {
        println!(
            "  Formation {}: {:?} {:?}, leader {:?}, speed {:.1}",
            formation.id, formation.pattern, formation.state, formation.leader, formation.speed
        );
    }
    for unit in &snapshot.units {
        println!(
            "    Unit {} {:?}: pos=({:.1}, {:.1}) vel=({:.1}, {:.1}) waypoints={}",
            unit.id, unit.kind, unit.x, unit.z, unit.vx, unit.vz, unit.waypoints
        );
    }
}
