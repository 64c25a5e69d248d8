mod coalescing;
